//! Logging and metrics setup.
//!
//! Logs go to stderr and to `synctabs-companion.log` in the data folder. The
//! level filter sits behind a reload layer so `POST /config` can change it
//! while the hub is running.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as fmt_layer, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

pub const LOG_FILE: &str = "synctabs-companion.log";
/// A log file at or above this size is moved to `<file>.bak` at startup.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_FILTER_ENV: &str = "SYNCTABS_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Unknown names fall back to `info`.
    pub fn from_name_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_default()
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(LogLevel::from_name_or_default(&name))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Handles the hub keeps for runtime changes and the `/metrics` endpoint.
/// Both are absent in tests, where no global subscriber or recorder exists.
#[derive(Clone, Default)]
pub struct Telemetry {
    pub logs: Option<LogControl>,
    pub metrics: Option<PrometheusHandle>,
}

/// Changes the active log level after startup.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    /// Set when the filter came from the environment; config changes are
    /// then ignored.
    pinned: bool,
    path: PathBuf,
}

impl LogControl {
    pub fn set_level(&self, level: LogLevel) -> Result<(), InitError> {
        if self.pinned {
            return Ok(());
        }
        self.handle
            .reload(EnvFilter::new(default_filter_for(level.to_filter())))
            .map_err(|err| InitError::Configure(err.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn init_logging(level: LogLevel, data_folder: &Path) -> Result<LogControl, InitError> {
    if GUARD.get().is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    std::fs::create_dir_all(data_folder).map_err(|source| InitError::Io {
        path: data_folder.to_path_buf(),
        source,
    })?;
    let path = data_folder.join(LOG_FILE);
    rotate_if_large(&path);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| InitError::Io {
            path: path.clone(),
            source,
        })?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let (env_filter, pinned) = build_env_filter(level.to_filter());
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_writer(std::io::stderr))
        .with(
            fmt_layer::layer()
                .with_ansi(false)
                .with_target(level >= LogLevel::Debug)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(LogControl {
        handle,
        pinned,
        path,
    })
}

pub fn install_metrics() -> Result<PrometheusHandle, InitError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| InitError::Metrics(err.to_string()))
}

fn rotate_if_large(path: &Path) {
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    if meta.len() < MAX_LOG_BYTES {
        return;
    }
    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    let _ = std::fs::remove_file(&backup);
    if let Err(err) = std::fs::rename(path, &backup) {
        eprintln!("[synctabs] could not rotate {}: {err}", path.display());
    }
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    for var in [LOG_FILTER_ENV, "RUST_LOG"] {
        if let Ok(filter) = std::env::var(var) {
            if !filter.trim().is_empty() {
                return (EnvFilter::new(filter), true);
            }
        }
    }
    (EnvFilter::new(default_filter_for(level)), false)
}

const NOISY_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "tungstenite", "tokio_tungstenite", "reqwest"];

fn default_filter_for(level: LevelFilter) -> String {
    let mut filter = level.to_string().to_lowercase();
    if level == LevelFilter::DEBUG {
        for target in NOISY_DEPENDENCIES {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
    }
    filter
}
