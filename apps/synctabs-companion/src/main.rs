use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use synctabs_companion::cli::{Cli, LaunchOptions};
use synctabs_companion::config::{ConfigStore, APP_NAME, APP_VERSION};
use synctabs_companion::instance::{self, InstanceCheck};
use synctabs_companion::server::Hub;
use synctabs_companion::telemetry::{self, Telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let options = LaunchOptions::try_from(cli)?;

    let store = ConfigStore::load(&options.config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            options.config_path.display()
        )
    })?;
    if !options.overrides.is_empty() {
        store
            .override_with(&options.overrides)
            .context("invalid command-line override")?;
    }
    let config = store.get();

    let logs = match telemetry::init_logging(config.log_level, &config.data_folder) {
        Ok(logs) => Some(logs),
        Err(err) => {
            eprintln!("[synctabs] failed to initialize logging: {err}");
            None
        }
    };
    let metrics = match telemetry::install_metrics() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "metrics disabled");
            None
        }
    };

    info!(
        version = APP_VERSION,
        port = config.port,
        data_folder = %config.data_folder.display(),
        config_path = %store.path().display(),
        "starting {APP_NAME}"
    );

    if options.check_instance {
        match instance::probe(config.port).await {
            InstanceCheck::PortFree => {}
            InstanceCheck::AlreadyRunning => {
                info!(port = config.port, "another instance is already running; exiting");
                return Ok(());
            }
            InstanceCheck::InUseByOther => bail!(
                "port {} is already in use by another application; change the port in {} and restart",
                config.port,
                store.path().display()
            ),
        }
    }

    let hub = Hub::open(Arc::new(store), Telemetry { logs, metrics })
        .context("failed to open data stores")?;
    hub.start().await.context("failed to start server")?;

    shutdown_signal().await;
    info!("shutdown signal received");
    hub.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
