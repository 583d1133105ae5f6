//! Single-instance detection through the `/health` endpoint.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::APP_ID;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCheck {
    PortFree,
    AlreadyRunning,
    InUseByOther,
}

#[derive(Debug, Deserialize)]
struct HealthProbe {
    #[serde(default)]
    app: String,
}

/// Asks whatever listens on `127.0.0.1:<port>` who it is. Nothing answering
/// counts as a free port.
pub async fn probe(port: u16) -> InstanceCheck {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "could not build probe client; assuming port is free");
            return InstanceCheck::PortFree;
        }
    };

    let url = format!("http://127.0.0.1:{port}/health");
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!(port, error = %err, "no answer on port");
            return InstanceCheck::PortFree;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        return InstanceCheck::InUseByOther;
    }

    match response.json::<HealthProbe>().await {
        Ok(body) if body.app == APP_ID => InstanceCheck::AlreadyRunning,
        _ => InstanceCheck::InUseByOther,
    }
}
