#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use synctabs_companion::config::{ConfigStore, HubConfig};
use synctabs_companion::protocol::ServerMessage;
use synctabs_companion::server::Hub;
use synctabs_companion::telemetry::Telemetry;

pub type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// A hub on an ephemeral port with its data under `dir`.
pub async fn start_hub(dir: &Path) -> (Hub, SocketAddr) {
    start_hub_with(dir, Telemetry::default()).await
}

pub async fn start_hub_with(dir: &Path, telemetry: Telemetry) -> (Hub, SocketAddr) {
    let config = HubConfig {
        port: 0,
        data_folder: dir.join("data"),
        ..HubConfig::default()
    };
    let store = Arc::new(ConfigStore::new(dir.join("config.json"), config));
    let hub = Hub::open(store, telemetry).expect("open hub");
    let addr = hub.start().await.expect("start hub");
    (hub, addr)
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    listener.local_addr().expect("probe addr").port()
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/"))
            .await
            .expect("websocket connect");
        Self { ws }
    }

    /// Connects and registers, consuming the `full-state` reply.
    pub async fn register(addr: SocketAddr, id: &str, name: &str) -> (Self, ServerMessage) {
        let mut client = Self::connect(addr).await;
        client
            .send(serde_json::json!({"type": "register", "browserId": id, "browserName": name}))
            .await;
        let state = client.recv().await;
        assert!(
            matches!(state, ServerMessage::FullState { .. }),
            "expected full-state, got {state:?}"
        );
        (client, state)
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(message.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: String) {
        self.ws.send(Message::text(text)).await.expect("websocket send");
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("no message before timeout")
    }

    /// `None` once the connection is closed or nothing arrives in time.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).expect("server message json"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Reads until a message matching `pred` arrives.
    pub async fn recv_until(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
