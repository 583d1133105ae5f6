use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_URL_LEN: usize = 2048;
pub const MAX_TITLE_LEN: usize = 500;
pub const DEFAULT_TAB_TITLE: &str = "New Tab";

/// Client-chosen token naming one browser installation.
///
/// The empty string and the JavaScript leftovers `"null"` / `"undefined"`
/// never make it into a `BrowserId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BrowserId(String);

impl BrowserId {
    pub fn parse(raw: &str) -> Option<Self> {
        if is_valid_browser_id(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_valid_browser_id(raw: &str) -> bool {
    !matches!(raw, "" | "null" | "undefined")
}

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for BrowserId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for BrowserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        BrowserId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid browser id {raw:?}")))
    }
}

/// One open tab as reported by a browser.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Tab {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub fav_icon_url: String,
    pub pinned: bool,
    pub window_id: i64,
    pub active: bool,
    /// Milliseconds since the epoch; browsers report fractional values.
    pub last_accessed: f64,
    pub incognito: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserData {
    pub browser_name: String,
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub online: bool,
}

/// A tab waiting for its recipient to come online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTab {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub fav_icon_url: String,
    #[serde(default)]
    pub sender_browser_id: String,
    #[serde(default)]
    pub sender_browser_name: String,
    #[serde(default)]
    pub sent_at: String,
}

impl PendingTab {
    pub fn new(
        url: &str,
        title: &str,
        fav_icon_url: &str,
        sender: &BrowserId,
        sender_name: &str,
    ) -> Self {
        Self {
            url: truncate(url, MAX_URL_LEN),
            title: truncate(title, MAX_TITLE_LEN),
            fav_icon_url: truncate(fav_icon_url, MAX_URL_LEN),
            sender_browser_id: sender.to_string(),
            sender_browser_name: sender_name.to_string(),
            sent_at: now_rfc3339(),
        }
    }
}

/// Cuts `value` to at most `max_chars` characters.
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}

/// Clamps a reported tab list to `max_tabs` and normalizes every tab in place.
pub fn sanitize_tabs(mut tabs: Vec<Tab>, max_tabs: usize) -> Vec<Tab> {
    tabs.truncate(max_tabs);
    let now = now_millis();
    for tab in &mut tabs {
        if tab.url.chars().count() > MAX_URL_LEN {
            tab.url = truncate(&tab.url, MAX_URL_LEN);
        }
        if tab.title.chars().count() > MAX_TITLE_LEN {
            tab.title = truncate(&tab.title, MAX_TITLE_LEN);
        }
        if tab.fav_icon_url.chars().count() > MAX_URL_LEN {
            tab.fav_icon_url = truncate(&tab.fav_icon_url, MAX_URL_LEN);
        }
        if tab.title.is_empty() {
            tab.title = DEFAULT_TAB_TITLE.to_string();
        }
        if tab.last_accessed == 0.0 {
            tab.last_accessed = now;
        }
    }
    tabs
}

/// Only web and ftp links may be sent between browsers.
pub fn is_valid_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        // `Url` lowercases the scheme while parsing.
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https" | "ftp"),
        Err(_) => false,
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

/// Oldest acceptable timestamp for entries kept within `freshness`.
pub fn freshness_cutoff(freshness: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(freshness)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// True when `timestamp` parses as RFC 3339 and lies before `cutoff`.
/// Unparseable timestamps are never considered stale.
pub fn is_older_than(timestamp: &str, cutoff: DateTime<Utc>) -> bool {
    if timestamp.is_empty() {
        return false;
    }
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc) < cutoff)
        .unwrap_or(false)
}
