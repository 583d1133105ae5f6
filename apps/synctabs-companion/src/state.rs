use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::model::{freshness_cutoff, is_older_than, now_rfc3339, BrowserData, BrowserId, Tab};
use crate::record::{RecordError, RecordFile, SaveScheduler, SAVE_DEBOUNCE};

pub const STATE_FILE: &str = "tabs.json";

/// What a client gets in a `full-state` message.
pub type BrowserSnapshot = BTreeMap<BrowserId, BrowserData>;

struct StateInner {
    entries: RwLock<HashMap<BrowserId, BrowserData>>,
    file: RecordFile,
}

impl StateInner {
    fn flush(&self) -> Result<(), RecordError> {
        self.file.save_with(|| {
            self.entries
                .read()
                .iter()
                .map(|(id, data)| (id.clone(), data.clone()))
                .collect::<BrowserSnapshot>()
        })
    }
}

/// Shared view of every browser the hub has seen, backed by `tabs.json`.
#[derive(Clone)]
pub struct BrowserStateStore {
    inner: Arc<StateInner>,
    saver: Arc<SaveScheduler>,
}

impl BrowserStateStore {
    /// Loads `tabs.json` from `folder`, dropping entries that are invalid or
    /// have not been seen within `freshness`. Every survivor starts offline.
    pub fn open(folder: impl Into<PathBuf>, freshness: Duration) -> Result<Self, RecordError> {
        let file = RecordFile::new(folder, STATE_FILE);
        let document = file.load()?;
        let cutoff = freshness_cutoff(freshness);

        let mut entries = HashMap::with_capacity(document.len());
        for (key, raw) in document {
            let Some(id) = BrowserId::parse(&key) else {
                continue;
            };
            let mut data = match serde_json::from_value::<BrowserData>(raw) {
                Ok(data) => data,
                Err(err) => {
                    debug!(browser_id = %id, error = %err, "skipping undecodable browser entry");
                    continue;
                }
            };
            if data.browser_name.is_empty() {
                continue;
            }
            if is_older_than(&data.last_seen, cutoff) {
                debug!(browser_id = %id, browser_name = %data.browser_name, "dropping stale entry");
                continue;
            }
            data.online = false;
            entries.insert(id, data);
        }

        info!(
            browsers = entries.len(),
            path = %file.path().display(),
            "loaded browser state"
        );

        let inner = Arc::new(StateInner {
            entries: RwLock::new(entries),
            file,
        });
        let flush_inner = Arc::clone(&inner);
        let saver = SaveScheduler::spawn("state", SAVE_DEBOUNCE, move || flush_inner.flush());

        Ok(Self {
            inner,
            saver: Arc::new(saver),
        })
    }

    /// Marks `id` online under `name` and returns everyone else.
    ///
    /// Offline entries under a different id but the same name are removed
    /// first: a browser that lost its id across a restart comes back under a
    /// new one. Online entries are left alone even when the names match.
    pub fn register(&self, id: &BrowserId, name: &str) -> BrowserSnapshot {
        let now = now_rfc3339();
        {
            let mut entries = self.inner.entries.write();
            entries.retain(|other, data| {
                let duplicate = other != id && data.browser_name == name && !data.online;
                if duplicate {
                    debug!(browser_name = %name, old_id = %other, "removing stale duplicate");
                }
                !duplicate
            });

            match entries.get_mut(id) {
                Some(existing) => {
                    existing.browser_name = name.to_string();
                    existing.online = true;
                    existing.last_seen = now;
                }
                None => {
                    entries.insert(
                        id.clone(),
                        BrowserData {
                            browser_name: name.to_string(),
                            tabs: Vec::new(),
                            last_seen: now,
                            online: true,
                        },
                    );
                }
            }
        }
        self.saver.request();
        self.snapshot_excluding(id)
    }

    /// Replaces the tab list of a known browser and returns the new entry.
    pub fn update_tabs(&self, id: &BrowserId, tabs: Vec<Tab>) -> Option<BrowserData> {
        let updated = {
            let mut entries = self.inner.entries.write();
            entries.get_mut(id).map(|entry| {
                entry.tabs = tabs;
                entry.last_seen = now_rfc3339();
                entry.clone()
            })
        };
        self.saver.request();
        updated
    }

    pub fn set_offline(&self, id: &BrowserId) {
        {
            let mut entries = self.inner.entries.write();
            if let Some(entry) = entries.get_mut(id) {
                entry.online = false;
                entry.last_seen = now_rfc3339();
            }
        }
        self.saver.request();
    }

    pub fn snapshot_excluding(&self, id: &BrowserId) -> BrowserSnapshot {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(other, _)| *other != id)
            .map(|(other, data)| (other.clone(), data.clone()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<BrowserData> {
        self.inner.entries.read().get(id).cloned()
    }

    pub fn get_all(&self) -> BrowserSnapshot {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(id, data)| (id.clone(), data.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> PathBuf {
        self.inner.file.path()
    }

    /// Moves the backing file to `folder` and writes the current state there.
    pub fn relocate(&self, folder: &Path) -> Result<(), RecordError> {
        self.inner.file.relocate(folder)?;
        self.saver.flush_now()
    }

    pub fn flush(&self) -> Result<(), RecordError> {
        self.saver.flush_now()
    }
}
