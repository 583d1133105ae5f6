use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{BrowserData, BrowserId, PendingTab, Tab};
use crate::state::BrowserSnapshot;

/// Messages sent from a browser to the hub.
///
/// Identity fields stay plain strings here so that the engine can answer
/// bad ids with a specific error instead of dropping the frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        #[serde(default, deserialize_with = "null_as_empty")]
        browser_id: String,
        #[serde(default, deserialize_with = "null_as_empty")]
        browser_name: String,
    },
    /// `tabs` is decoded later so a bad array can be reported on its own.
    TabsUpdate {
        #[serde(default)]
        tabs: Option<serde_json::Value>,
    },
    RequestState,
    #[serde(rename_all = "camelCase")]
    SendTab {
        #[serde(default, deserialize_with = "null_as_empty")]
        target_browser_id: String,
        #[serde(default)]
        tab: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

/// `null` reads as an empty string, which the engine then rejects by name.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::TabsUpdate { .. } => "tabs-update",
            ClientMessage::RequestState => "request-state",
            ClientMessage::SendTab { .. } => "send-tab",
            ClientMessage::Unknown => "unknown",
        }
    }
}

/// The tab carried by a `send-tab` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutgoingTab {
    pub url: String,
    pub title: String,
    pub fav_icon_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Queued,
}

/// Messages sent from the hub to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Every browser except the recipient.
    FullState { browsers: BrowserSnapshot },
    #[serde(rename_all = "camelCase")]
    Presence {
        browser_id: BrowserId,
        browser_name: String,
        online: bool,
        last_seen: String,
    },
    #[serde(rename_all = "camelCase")]
    BrowserTabsUpdated {
        browser_id: BrowserId,
        browser_name: String,
        tabs: Vec<Tab>,
        last_seen: String,
        online: bool,
    },
    PendingTabs { tabs: Vec<PendingTab> },
    #[serde(rename_all = "camelCase")]
    SendTabAck {
        status: DeliveryStatus,
        target_browser_id: BrowserId,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn presence(browser_id: &BrowserId, data: &BrowserData, online: bool) -> Self {
        ServerMessage::Presence {
            browser_id: browser_id.clone(),
            browser_name: data.browser_name.clone(),
            online,
            last_seen: data.last_seen.clone(),
        }
    }
}
