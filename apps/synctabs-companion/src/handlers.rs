use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ConfigPatch, HubConfig, APP_ID, APP_VERSION};
use crate::model::BrowserId;
use crate::server::AppState;
use crate::telemetry::LogLevel;

/// Delay between answering a port change and restarting, so the reply
/// leaves before the listener goes away.
const RESTART_DELAY: Duration = Duration::from_millis(200);
const SENTINEL_RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSummary {
    pub browser_name: String,
    pub tab_count: usize,
    pub online: bool,
    pub last_seen: String,
}

/// `app` lets a starting companion recognise an instance already holding
/// the port.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub browsers: BTreeMap<BrowserId, BrowserSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub version: &'static str,
    pub uptime_seconds: f64,
    pub port: u16,
    pub connections: usize,
    pub connected_browsers: Vec<String>,
    pub pending_tabs: usize,
    pub log_level: LogLevel,
    pub data_folder: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub ok: bool,
    pub config: HubConfig,
    pub restart_needed: bool,
}

pub async fn health(State(app): State<AppState>) -> Json<HealthResponse> {
    let browsers = app
        .hub
        .state()
        .get_all()
        .into_iter()
        .map(|(id, data)| {
            (
                id,
                BrowserSummary {
                    browser_name: data.browser_name,
                    tab_count: data.tabs.len(),
                    online: data.online,
                    last_seen: data.last_seen,
                },
            )
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        app: APP_ID,
        browsers,
    })
}

pub async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    let hub = &app.hub;
    let config = hub.config();
    Json(StatusResponse {
        status: "ok",
        app: APP_ID,
        version: APP_VERSION,
        uptime_seconds: hub.uptime_seconds(),
        port: hub.current_port(),
        connections: hub.connected_count(),
        connected_browsers: hub.browser_names(),
        pending_tabs: hub.pending().pending_count(),
        log_level: config.log_level,
        data_folder: config.data_folder,
    })
}

pub async fn get_config(State(app): State<AppState>) -> Json<HubConfig> {
    Json(app.hub.config())
}

/// Applies a partial config. The body is parsed by hand so malformed JSON
/// gets a plain 400 like any other invalid value.
pub async fn update_config(State(app): State<AppState>, body: Bytes) -> Response {
    let patch: ConfigPatch = match serde_json::from_slice(&body) {
        Ok(patch) => patch,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON: {err}")).into_response();
        }
    };

    let hub = app.hub;
    let update = match hub.config_store().apply(&patch) {
        Ok(update) => update,
        Err(err) => {
            warn!(error = %err, "rejected config update");
            return (StatusCode::BAD_REQUEST, format!("Invalid config: {err}")).into_response();
        }
    };
    let config = update.config.clone();

    if update.log_level_changed {
        if let Some(logs) = hub.log_control() {
            if let Err(err) = logs.set_level(config.log_level) {
                warn!(error = %err, "failed to apply log level");
            }
        }
        info!(log_level = %config.log_level, "log level changed");
    }
    if let Some(auto_start) = patch.auto_start {
        info!(auto_start, "auto-start preference saved");
    }
    if update.data_folder_changed && !update.restart_needed {
        if let Err(err) = hub.relocate_data(&config.data_folder) {
            error!(error = %err, "failed to move data folder");
        }
    }

    if update.restart_needed {
        let delay = if patch.restart {
            SENTINEL_RESTART_DELAY
        } else {
            RESTART_DELAY
        };
        let next = config.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = hub.restart(next).await {
                error!(error = %err, "restart failed");
            }
        });
    }

    Json(ConfigResponse {
        ok: true,
        config,
        restart_needed: update.restart_needed,
    })
    .into_response()
}

pub async fn metrics(State(app): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.hub.render_metrics(),
    )
}
