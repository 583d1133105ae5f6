//! SyncTabs Companion: a loopback WebSocket hub that shares the open-tab
//! lists of the browsers on one machine and relays tabs between them.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod instance;
pub mod model;
pub mod pending;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod websocket;

pub use config::{ConfigStore, HubConfig};
pub use server::{Hub, ServerError};
