use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{ConfigStore, HubConfig};
use crate::handlers;
use crate::pending::PendingStore;
use crate::record::RecordError;
use crate::registry::ConnectionRegistry;
use crate::state::BrowserStateStore;
use crate::telemetry::{LogControl, Telemetry};
use crate::websocket::websocket_handler;

/// How long `stop` waits for the server task before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("server is already running on port {0}")]
    AlreadyRunning(u16),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Router state: the hub plus the stop signal of the server instance that
/// accepted the request.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub shutdown: watch::Receiver<bool>,
}

struct RunningServer {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<io::Result<()>>,
}

struct HubInner {
    config: Arc<ConfigStore>,
    state: BrowserStateStore,
    pending: PendingStore,
    registry: ConnectionRegistry,
    telemetry: Telemetry,
    /// Folder the stores currently write to.
    data_folder: RwLock<PathBuf>,
    running: Mutex<Option<RunningServer>>,
    port: AtomicU16,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

/// Owns the stores and the connection registry for the life of the process;
/// the listener in front of them can be stopped and started again.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Opens both stores under the configured data folder. Must be called
    /// from within a tokio runtime.
    pub fn open(config: Arc<ConfigStore>, telemetry: Telemetry) -> Result<Self, ServerError> {
        let current = config.get();
        let freshness = current.freshness();
        let state = BrowserStateStore::open(&current.data_folder, freshness)?;
        let pending = PendingStore::open(&current.data_folder, freshness)?;

        Ok(Self {
            inner: Arc::new(HubInner {
                config,
                state,
                pending,
                registry: ConnectionRegistry::new(),
                telemetry,
                data_folder: RwLock::new(current.data_folder),
                running: Mutex::new(None),
                port: AtomicU16::new(current.port),
                started_at: RwLock::new(None),
            }),
        })
    }

    /// Binds `127.0.0.1:<port>` and serves in a background task. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.inner.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Err(ServerError::AlreadyRunning(server.port));
        }

        let port = self.inner.config.get().port;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { port, source })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(AppState {
            hub: self.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let mut stop = shutdown_rx;
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            })
            .await
        });

        self.inner.port.store(addr.port(), Ordering::Relaxed);
        *self.inner.started_at.write() = Some(Utc::now());
        *running = Some(RunningServer {
            port: addr.port(),
            shutdown: shutdown_tx,
            task,
        });

        info!(addr = %addr, "server listening on ws://{addr}");
        Ok(addr)
    }

    /// Stops accepting, closes every connection and waits up to
    /// [`SHUTDOWN_GRACE`] for the server task.
    pub async fn stop(&self) {
        let Some(server) = self.inner.running.lock().await.take() else {
            return;
        };

        let _ = server.shutdown.send(true);
        let closed = self.inner.registry.close_all();
        info!(port = server.port, connections = closed, "stopping server");

        let mut task = server.task;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => info!(port = server.port, "server stopped"),
            Ok(Ok(Err(err))) => warn!(port = server.port, error = %err, "server exited with error"),
            Ok(Err(err)) => warn!(port = server.port, error = %err, "server task failed"),
            Err(_) => {
                warn!(
                    grace_seconds = SHUTDOWN_GRACE.as_secs(),
                    "server did not stop within grace period; aborting"
                );
                task.abort();
            }
        }
    }

    /// Stops, adopts `config`, moves the stores when the data folder changed
    /// and starts again. The stores stay in memory throughout.
    pub async fn restart(&self, config: HubConfig) -> Result<SocketAddr, ServerError> {
        info!(port = config.port, "restarting server");
        self.stop().await;

        let folder = config.data_folder.clone();
        self.inner.config.replace(config);
        if let Err(err) = self.relocate_data(&folder) {
            error!(error = %err, "failed to move data during restart");
        }

        self.start().await
    }

    /// Points both stores at `folder` and writes their contents there.
    /// Returns false when they already live there.
    pub fn relocate_data(&self, folder: &Path) -> Result<bool, RecordError> {
        if self.inner.data_folder.read().as_path() == folder {
            return Ok(false);
        }
        info!(folder = %folder.display(), "moving data folder");

        let state = self.inner.state.relocate(folder);
        let pending = self.inner.pending.relocate(folder);
        *self.inner.data_folder.write() = folder.to_path_buf();
        state?;
        pending?;
        Ok(true)
    }

    /// Stops the server and writes both stores synchronously.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Err(err) = self.inner.state.flush() {
            error!(error = %err, "failed to save browser state on shutdown");
        }
        if let Err(err) = self.inner.pending.flush() {
            error!(error = %err, "failed to save pending tabs on shutdown");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn browser_names(&self) -> Vec<String> {
        self.inner.registry.names(&self.inner.state)
    }

    /// When the current (or last) listener was started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.started_at.read()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at()
            .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    pub fn current_port(&self) -> u16 {
        self.inner.port.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> HubConfig {
        self.inner.config.get()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn max_tabs_per_browser(&self) -> usize {
        self.inner.config.get().max_tabs_per_browser
    }

    pub fn data_folder(&self) -> PathBuf {
        self.inner.data_folder.read().clone()
    }

    pub fn state(&self) -> &BrowserStateStore {
        &self.inner.state
    }

    pub fn pending(&self) -> &PendingStore {
        &self.inner.pending
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn log_control(&self) -> Option<&LogControl> {
        self.inner.telemetry.logs.as_ref()
    }

    pub fn render_metrics(&self) -> String {
        self.inner
            .telemetry
            .metrics
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route(
            "/config",
            get(handlers::get_config).post(handlers::update_config),
        )
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(require_loopback))
        .with_state(state)
}

pub fn is_loopback_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

async fn require_loopback(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if is_loopback_peer(remote_addr.ip()) {
        next.run(request).await
    } else {
        warn!(remote_addr = %remote_addr, "rejecting non-loopback peer");
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test_timeout::timeout]
    fn only_loopback_peers_pass() {
        assert!(is_loopback_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_loopback_peer(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_loopback_peer("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback_peer("192.168.1.20".parse().unwrap()));
        assert!(!is_loopback_peer("::ffff:10.0.0.1".parse().unwrap()));
    }

    fn hub_in(dir: &Path) -> Hub {
        let config = HubConfig {
            port: 0,
            data_folder: dir.join("data"),
            ..HubConfig::default()
        };
        let store = Arc::new(ConfigStore::new(dir.join("config.json"), config));
        Hub::open(store, Telemetry::default()).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path());

        let addr = hub.start().await.unwrap();
        assert_eq!(hub.current_port(), addr.port());
        assert!(matches!(hub.start().await, Err(ServerError::AlreadyRunning(_))));

        hub.stop().await;
        assert!(!hub.is_running().await);
    }

    #[test_timeout::tokio_timeout_test]
    async fn bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let hub = hub_in(dir.path());
        hub.config_store().replace(HubConfig {
            port,
            ..hub.config()
        });

        let err = hub.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { port: p, .. } if p == port));
    }

    #[test_timeout::tokio_timeout_test]
    async fn restart_moves_data_and_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_in(dir.path());
        hub.start().await.unwrap();
        hub.state()
            .register(&crate::model::BrowserId::parse("a").unwrap(), "Chrome");

        let moved = dir.path().join("moved");
        let config = HubConfig {
            data_folder: moved.clone(),
            ..hub.config()
        };
        hub.restart(config).await.unwrap();

        assert!(hub.is_running().await);
        assert_eq!(hub.data_folder(), moved);
        assert!(moved.join(crate::state::STATE_FILE).exists());
        assert!(hub.state().get("a").is_some());
        hub.shutdown().await;
    }
}
