use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::{is_valid_url, sanitize_tabs, BrowserId, PendingTab, Tab};
use crate::protocol::{ClientMessage, DeliveryStatus, OutgoingTab, ServerMessage};
use crate::registry::ConnectionHandle;
use crate::server::{AppState, Hub};

/// Payloads above this size are answered with an error and dropped.
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024;
/// Anything bigger is refused by the WebSocket layer and ends the connection.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_MAX_MESSAGES: usize = 50;

/// Sliding-window message counter for one connection.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max: usize,
    hits: VecDeque<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MAX_MESSAGES, RATE_LIMIT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max,
            hits: VecDeque::with_capacity(max + 1),
        }
    }

    /// Records a message received at `now` and reports whether it is within
    /// the limit. Rejected messages still count against the window.
    pub fn check(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.hits.len() <= self.max
    }
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, app, remote_addr))
}

#[derive(Debug, Clone)]
struct Identity {
    id: BrowserId,
    name: String,
}

/// Per-connection protocol state.
struct Session {
    hub: Hub,
    handle: ConnectionHandle,
    identity: Option<Identity>,
    limiter: RateLimiter,
}

async fn handle_socket(socket: WebSocket, app: AppState, remote_addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = ConnectionHandle::new(tx);
    let connection_id = handle.id();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task ended");
    });

    debug!(connection_id = %connection_id, remote_addr = %remote_addr, "websocket connected");

    let mut shutdown = app.shutdown.clone();
    let mut session = Session {
        hub: app.hub,
        handle: handle.clone(),
        identity: None,
        limiter: RateLimiter::default(),
    };

    if !*shutdown.borrow() {
        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = handle.closed() => {
                    debug!(connection_id = %connection_id, "connection closed by hub");
                    break;
                }
                _ = shutdown.changed() => break,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                    break;
                }
                None => break,
            };

            match message {
                Message::Text(text) => session.on_frame(text.len(), Some(text)),
                Message::Binary(bytes) => {
                    let len = bytes.len();
                    session.on_frame(len, String::from_utf8(bytes).ok())
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    session.disconnect();
    handle.send_close();
    drop(session);
    drop(handle);
    let _ = writer.await;

    debug!(connection_id = %connection_id, "websocket disconnected");
}

impl Session {
    fn reply(&self, message: ServerMessage) {
        self.handle.send(&message);
    }

    fn reject(&self, reason: &'static str, message: &str) {
        counter!("synctabs_messages_rejected_total", 1, "reason" => reason);
        self.reply(ServerMessage::error(message));
    }

    fn on_frame(&mut self, len: usize, text: Option<String>) {
        if len > MAX_MESSAGE_BYTES {
            debug!(connection_id = %self.handle.id(), bytes = len, "message too large");
            self.reject("too_large", "Message too large");
            return;
        }
        if !self.limiter.check(Instant::now()) {
            debug!(connection_id = %self.handle.id(), "rate limited");
            self.reject("rate_limited", "Rate limited");
            return;
        }

        let Some(text) = text else {
            debug!(connection_id = %self.handle.id(), "dropping non-utf8 binary frame");
            return;
        };
        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(err) => {
                counter!("synctabs_messages_rejected_total", 1, "reason" => "malformed");
                debug!(connection_id = %self.handle.id(), error = %err, "dropping malformed message");
                return;
            }
        };
        counter!("synctabs_messages_total", 1, "type" => message.kind());

        match message {
            ClientMessage::Register {
                browser_id,
                browser_name,
            } => self.register(&browser_id, &browser_name),
            ClientMessage::TabsUpdate { tabs } => self.tabs_update(tabs),
            ClientMessage::RequestState => self.request_state(),
            ClientMessage::SendTab {
                target_browser_id,
                tab,
            } => self.send_tab(&target_browser_id, tab),
            ClientMessage::Unknown => {
                debug!(connection_id = %self.handle.id(), "ignoring unknown message type");
            }
        }
    }

    fn register(&mut self, raw_id: &str, name: &str) {
        let Some(id) = BrowserId::parse(raw_id) else {
            self.reject("invalid", "Invalid browserId");
            return;
        };
        if name.is_empty() {
            self.reject("invalid", "Missing browserName");
            return;
        }

        if let Some(previous) = self.identity.take() {
            if previous.id != id {
                info!(
                    old_browser_id = %previous.id,
                    browser_id = %id,
                    "connection switched identity"
                );
                self.release(&previous);
            }
        }
        self.identity = Some(Identity {
            id: id.clone(),
            name: name.to_string(),
        });

        let registry = self.hub.registry();
        if let Some(evicted) = registry.set(id.clone(), self.handle.clone()) {
            if evicted.id() != self.handle.id() {
                info!(browser_id = %id, "replacing older connection for browser");
                evicted.close();
            }
        }
        gauge!("synctabs_connections_active", registry.count() as f64);

        let state = self.hub.state();
        let others = state.register(&id, name);
        self.reply(ServerMessage::FullState { browsers: others });
        if let Some(entry) = state.get(id.as_str()) {
            registry.broadcast(&id, &ServerMessage::presence(&id, &entry, true));
        }

        let queued = self.hub.pending().deliver_all(&id);
        if !queued.is_empty() {
            counter!("synctabs_tabs_delivered_total", queued.len() as u64, "path" => "queued");
            info!(browser_id = %id, count = queued.len(), "delivering pending tabs");
            self.reply(ServerMessage::PendingTabs { tabs: queued });
        }

        info!(browser_id = %id, browser_name = %name, "browser registered");
    }

    fn tabs_update(&self, tabs: Option<serde_json::Value>) {
        let Some(identity) = &self.identity else {
            return;
        };
        let Some(raw) = tabs.filter(|value| !value.is_null()) else {
            return;
        };
        let tabs: Vec<Tab> = match serde_json::from_value(raw) {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(browser_id = %identity.id, error = %err, "failed to parse tabs");
                return;
            }
        };
        if tabs.is_empty() {
            return;
        }

        let tabs = sanitize_tabs(tabs, self.hub.max_tabs_per_browser());
        let Some(entry) = self.hub.state().update_tabs(&identity.id, tabs) else {
            return;
        };
        debug!(browser_id = %identity.id, tabs = entry.tabs.len(), "tabs updated");

        self.hub.registry().broadcast(
            &identity.id,
            &ServerMessage::BrowserTabsUpdated {
                browser_id: identity.id.clone(),
                browser_name: entry.browser_name,
                tabs: entry.tabs,
                last_seen: entry.last_seen,
                online: true,
            },
        );
    }

    fn request_state(&self) {
        let Some(identity) = &self.identity else {
            return;
        };
        let browsers = self.hub.state().snapshot_excluding(&identity.id);
        self.reply(ServerMessage::FullState { browsers });
    }

    fn send_tab(&self, raw_target: &str, tab: Option<serde_json::Value>) {
        let Some(sender) = &self.identity else {
            return;
        };
        let tab = match tab.map(serde_json::from_value::<OutgoingTab>) {
            Some(Ok(tab)) if !tab.url.is_empty() => tab,
            _ => {
                self.reject("invalid", "Invalid send-tab payload");
                return;
            }
        };
        let Some(target) = BrowserId::parse(raw_target) else {
            self.reject("invalid", "Invalid targetBrowserId");
            return;
        };
        if !is_valid_url(&tab.url) {
            self.reject("invalid", "Invalid URL");
            return;
        }

        let pending = PendingTab::new(
            &tab.url,
            &tab.title,
            &tab.fav_icon_url,
            &sender.id,
            &sender.name,
        );

        if let Some(live) = self.hub.registry().get(target.as_str()) {
            let delivery = ServerMessage::PendingTabs {
                tabs: vec![pending.clone()],
            };
            if live.send(&delivery) {
                counter!("synctabs_tabs_delivered_total", 1, "path" => "live");
                debug!(from = %sender.id, to = %target, "tab delivered live");
                self.reply(ServerMessage::SendTabAck {
                    status: DeliveryStatus::Delivered,
                    target_browser_id: target,
                });
                return;
            }
        }

        match self.hub.pending().enqueue(&target, pending) {
            Ok(()) => {
                counter!("synctabs_pending_enqueued_total", 1);
                debug!(from = %sender.id, to = %target, "tab queued");
                self.reply(ServerMessage::SendTabAck {
                    status: DeliveryStatus::Queued,
                    target_browser_id: target,
                });
            }
            Err(full) => {
                warn!(to = %target, "pending queue full");
                self.reject("queue_full", &full.to_string());
            }
        }
    }

    /// Marks `identity` offline if this connection still owns its slot.
    fn release(&self, identity: &Identity) {
        let registry = self.hub.registry();
        if !registry.remove_if(&identity.id, self.handle.id()) {
            return;
        }
        gauge!("synctabs_connections_active", registry.count() as f64);

        let state = self.hub.state();
        state.set_offline(&identity.id);
        if let Some(entry) = state.get(identity.id.as_str()) {
            registry.broadcast(
                &identity.id,
                &ServerMessage::presence(&identity.id, &entry, false),
            );
        }
        info!(browser_id = %identity.id, browser_name = %identity.name, "browser went offline");
    }

    fn disconnect(&mut self) {
        if let Some(identity) = self.identity.take() {
            self.release(&identity);
        }
    }
}
