use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::BrowserId;
use crate::protocol::ServerMessage;
use crate::state::BrowserStateStore;

/// Write side of one live WebSocket connection.
///
/// Frames pushed through the handle are written in order by the
/// connection's writer task.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            close: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(err) => {
                warn!(connection_id = %self.id, error = %err, "failed to encode outbound message");
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    /// Queues a close frame; the writer stops after sending it.
    pub fn send_close(&self) -> bool {
        self.tx.send(Message::Close(None)).is_ok()
    }

    /// Asks the connection to shut itself down.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.close.notified().await
    }
}

/// Live connections keyed by the identity they registered under.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<BrowserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle` under `id`, returning whatever held the slot before.
    /// Closing the previous holder is the caller's job.
    pub fn set(&self, id: BrowserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(id, handle)
    }

    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Removes `id` only while it is still held by `connection_id`; a
    /// connection that was replaced cannot evict its successor.
    pub fn remove_if(&self, id: &BrowserId, connection_id: Uuid) -> bool {
        self.connections
            .remove_if(id, |_, handle| handle.id == connection_id)
            .is_some()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sends `message` to every connection except `exclude` and returns how
    /// many peers accepted it. Failures are logged and skipped.
    pub fn broadcast(&self, exclude: &BrowserId, message: &ServerMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<(BrowserId, ConnectionHandle)> = self
            .connections
            .iter()
            .filter(|entry| entry.key() != exclude)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, handle) in targets {
            if handle.send_text(text.clone()) {
                delivered += 1;
            } else {
                debug!(browser_id = %id, "broadcast send failed");
            }
        }
        delivered
    }

    /// Display names of the registered browsers, for status reporting.
    pub fn names(&self, state: &BrowserStateStore) -> Vec<String> {
        let ids: Vec<BrowserId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut names: Vec<String> = ids
            .iter()
            .filter_map(|id| state.get(id.as_str()))
            .map(|data| data.browser_name)
            .collect();
        names.sort();
        names
    }

    /// Signals every live connection to close.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}
