use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::record::{write_atomic, RecordError};
use crate::telemetry::LogLevel;

pub const APP_ID: &str = "synctabs-companion";
pub const APP_NAME: &str = "SyncTabs Companion";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_PORT: u16 = 9234;
pub const DEFAULT_MAX_TABS: usize = 500;
pub const MAX_TABS_LIMIT: usize = 10_000;
pub const DEFAULT_STALE_DAYS: u64 = 30;
pub const MIN_PORT: i64 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port {0} is outside 1024-65535")]
    InvalidPort(i64),
    #[error("could not determine a configuration directory")]
    NoConfigDir,
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Write(#[from] RecordError),
}

/// Settings of the companion, stored as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    pub port: u16,
    pub data_folder: PathBuf,
    pub log_level: LogLevel,
    pub max_tabs_per_browser: usize,
    /// Stored and reported only; registering with the OS is left to the
    /// installer.
    pub auto_start: bool,
    pub stale_days: u64,
    pub version: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_folder: default_data_folder(),
            log_level: LogLevel::Info,
            max_tabs_per_browser: DEFAULT_MAX_TABS,
            auto_start: false,
            stale_days: DEFAULT_STALE_DAYS,
            version: APP_VERSION.to_string(),
        }
    }
}

impl HubConfig {
    /// Age after which stored browsers and pending tabs are dropped at load.
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.stale_days.saturating_mul(24 * 60 * 60))
    }

    /// Replaces zero or empty values with defaults and stamps the version.
    fn normalized(mut self) -> Self {
        let defaults = HubConfig::default();
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.data_folder.as_os_str().is_empty() {
            self.data_folder = defaults.data_folder;
        }
        if self.max_tabs_per_browser == 0 {
            self.max_tabs_per_browser = defaults.max_tabs_per_browser;
        }
        if self.stale_days == 0 {
            self.stale_days = defaults.stale_days;
        }
        self.version = APP_VERSION.to_string();
        self
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "SyncTabs")
}

pub fn default_data_folder() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("data"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    project_dirs()
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

/// A partial update as posted to `/config`.
///
/// Numbers are kept wide so out-of-range values can be reported or reset
/// instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub port: Option<i64>,
    pub data_folder: Option<PathBuf>,
    pub log_level: Option<String>,
    pub max_tabs_per_browser: Option<i64>,
    pub auto_start: Option<bool>,
    /// Present (with any value) to ask for a restart without other changes.
    #[serde(rename = "_restart", default, deserialize_with = "key_present")]
    pub restart: bool,
}

fn key_present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    serde::de::IgnoredAny::deserialize(deserializer)?;
    Ok(true)
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub config: HubConfig,
    pub restart_needed: bool,
    pub data_folder_changed: bool,
    pub log_level_changed: bool,
}

/// Applies `patch` on top of `base`.
///
/// A port outside 1024-65535 rejects the whole patch. An out-of-range tab
/// limit falls back to the default, as does an unknown log level.
pub fn merge(base: &HubConfig, patch: &ConfigPatch) -> Result<ConfigUpdate, ConfigError> {
    if patch.restart {
        return Ok(ConfigUpdate {
            config: base.clone(),
            restart_needed: true,
            data_folder_changed: false,
            log_level_changed: false,
        });
    }

    let mut next = base.clone();
    if let Some(port) = patch.port {
        if !(MIN_PORT..=i64::from(u16::MAX)).contains(&port) {
            return Err(ConfigError::InvalidPort(port));
        }
        next.port = port as u16;
    }
    if let Some(folder) = &patch.data_folder {
        if !folder.as_os_str().is_empty() {
            next.data_folder = folder.clone();
        }
    }
    if let Some(level) = &patch.log_level {
        next.log_level = LogLevel::from_name_or_default(level);
    }
    if let Some(max_tabs) = patch.max_tabs_per_browser {
        next.max_tabs_per_browser = match usize::try_from(max_tabs) {
            Ok(n) if (1..=MAX_TABS_LIMIT).contains(&n) => n,
            _ => DEFAULT_MAX_TABS,
        };
    }
    if let Some(auto_start) = patch.auto_start {
        next.auto_start = auto_start;
    }
    next.version = APP_VERSION.to_string();

    Ok(ConfigUpdate {
        restart_needed: next.port != base.port,
        data_folder_changed: next.data_folder != base.data_folder,
        log_level_changed: next.log_level != base.log_level,
        config: next,
    })
}

/// The live configuration and the file it persists to.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<HubConfig>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: HubConfig) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(config),
        }
    }

    /// Reads `path`, writing defaults when the file is missing or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let loaded = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HubConfig>(&bytes) {
                Ok(config) => Some(config.normalized()),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt config, resetting to defaults");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        match loaded {
            Some(config) => Ok(Self::new(path, config)),
            None => {
                let store = Self::new(path, HubConfig::default());
                store.save()?;
                info!(path = %store.path.display(), "wrote default config");
                Ok(store)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> HubConfig {
        self.current.read().clone()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(&*self.current.read())?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Merges `patch` into the live config and persists the result. A failed
    /// write is logged; the new values stay in effect.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<ConfigUpdate, ConfigError> {
        let update = {
            let mut current = self.current.write();
            let update = merge(&current, patch)?;
            *current = update.config.clone();
            update
        };
        if let Err(err) = self.save() {
            warn!(path = %self.path.display(), error = %err, "failed to save config");
        }
        Ok(update)
    }

    /// Swaps in `config` without writing it.
    pub fn replace(&self, config: HubConfig) {
        *self.current.write() = config;
    }

    /// Merges `patch` for this run only; nothing is written.
    pub fn override_with(&self, patch: &ConfigPatch) -> Result<HubConfig, ConfigError> {
        let mut current = self.current.write();
        let update = merge(&current, patch)?;
        *current = update.config;
        Ok(current.clone())
    }
}
