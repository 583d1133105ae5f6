use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{default_config_path, ConfigPatch};
use crate::telemetry::LogLevel;

#[derive(Debug, Parser)]
#[command(
    name = "synctabs-companion",
    author,
    version,
    about = "Local hub that keeps the open tabs of your browsers in sync"
)]
pub struct Cli {
    /// Path to config.json. Defaults to the platform config directory.
    #[arg(long, env = "SYNCTABS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on for this run (not saved).
    #[arg(long, env = "SYNCTABS_PORT")]
    pub port: Option<u16>,

    /// Folder holding tabs.json, pending-tabs.json and the log (not saved).
    #[arg(long, env = "SYNCTABS_DATA_FOLDER")]
    pub data_folder: Option<PathBuf>,

    /// Log level for this run (not saved).
    #[arg(long, env = "SYNCTABS_LOG_LEVEL", value_enum)]
    pub log_level: Option<LogLevel>,

    /// Upper bound on tabs stored per browser (not saved).
    #[arg(long, env = "SYNCTABS_MAX_TABS")]
    pub max_tabs_per_browser: Option<i64>,

    /// Start even if another process answers on the port.
    #[arg(long, env = "SYNCTABS_SKIP_INSTANCE_CHECK", default_value_t = false)]
    pub skip_instance_check: bool,
}

/// What `main` needs from the command line.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub config_path: PathBuf,
    pub overrides: ConfigPatch,
    pub check_instance: bool,
}

impl TryFrom<Cli> for LaunchOptions {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let config_path = match cli.config {
            Some(path) => path,
            None => default_config_path().context("no --config given")?,
        };
        Ok(LaunchOptions {
            config_path,
            overrides: ConfigPatch {
                port: cli.port.map(i64::from),
                data_folder: cli.data_folder,
                log_level: cli.log_level.map(|level| level.as_str().to_string()),
                max_tabs_per_browser: cli.max_tabs_per_browser,
                ..ConfigPatch::default()
            },
            check_instance: !cli.skip_instance_check,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "synctabs-companion",
            "--config",
            "/tmp/synctabs/config.json",
            "--port",
            "9300",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let options = LaunchOptions::try_from(cli).unwrap();

        assert_eq!(options.config_path, PathBuf::from("/tmp/synctabs/config.json"));
        assert_eq!(options.overrides.port, Some(9300));
        assert_eq!(options.overrides.log_level.as_deref(), Some("debug"));
        assert!(options.overrides.data_folder.is_none());
        assert!(options.check_instance);
    }

    #[test_timeout::timeout]
    fn no_flags_means_no_overrides() {
        let cli = Cli::try_parse_from(["synctabs-companion", "--config", "c.json"]).unwrap();
        let options = LaunchOptions::try_from(cli).unwrap();
        assert!(options.overrides.is_empty());
    }
}
