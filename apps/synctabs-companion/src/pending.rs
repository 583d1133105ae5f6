use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{freshness_cutoff, is_older_than, BrowserId, PendingTab};
use crate::record::{RecordError, RecordFile, SaveScheduler, SAVE_DEBOUNCE};

pub const PENDING_FILE: &str = "pending-tabs.json";
pub const MAX_PENDING_PER_BROWSER: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Pending queue full for browser {target}")]
pub struct QueueFull {
    pub target: BrowserId,
}

struct PendingInner {
    queues: RwLock<HashMap<BrowserId, Vec<PendingTab>>>,
    file: RecordFile,
}

impl PendingInner {
    fn flush(&self) -> Result<(), RecordError> {
        self.file.save_with(|| {
            self.queues
                .read()
                .iter()
                .map(|(id, queue)| (id.clone(), queue.clone()))
                .collect::<BTreeMap<BrowserId, Vec<PendingTab>>>()
        })
    }
}

/// Tabs sent to browsers that were offline at the time, backed by
/// `pending-tabs.json`.
#[derive(Clone)]
pub struct PendingStore {
    inner: Arc<PendingInner>,
    saver: Arc<SaveScheduler>,
}

impl PendingStore {
    pub fn open(folder: impl Into<PathBuf>, freshness: Duration) -> Result<Self, RecordError> {
        let file = RecordFile::new(folder, PENDING_FILE);
        let document = file.load()?;
        let cutoff = freshness_cutoff(freshness);

        let mut queues = HashMap::with_capacity(document.len());
        for (key, raw) in document {
            let Some(id) = BrowserId::parse(&key) else {
                continue;
            };
            let items = match serde_json::from_value::<Vec<serde_json::Value>>(raw) {
                Ok(items) => items,
                Err(err) => {
                    debug!(browser_id = %id, error = %err, "skipping undecodable pending queue");
                    continue;
                }
            };
            let fresh: Vec<PendingTab> = items
                .into_iter()
                .filter_map(|item| match serde_json::from_value::<PendingTab>(item) {
                    Ok(tab) => Some(tab),
                    Err(err) => {
                        debug!(browser_id = %id, error = %err, "skipping undecodable pending tab");
                        None
                    }
                })
                .filter(|tab| !is_older_than(&tab.sent_at, cutoff))
                .collect();
            if !fresh.is_empty() {
                queues.insert(id, fresh);
            }
        }

        info!(
            recipients = queues.len(),
            path = %file.path().display(),
            "loaded pending tabs"
        );

        let inner = Arc::new(PendingInner {
            queues: RwLock::new(queues),
            file,
        });
        let flush_inner = Arc::clone(&inner);
        let saver = SaveScheduler::spawn("pending", SAVE_DEBOUNCE, move || flush_inner.flush());

        Ok(Self {
            inner,
            saver: Arc::new(saver),
        })
    }

    pub fn enqueue(&self, target: &BrowserId, tab: PendingTab) -> Result<(), QueueFull> {
        {
            let mut queues = self.inner.queues.write();
            let queue = queues.entry(target.clone()).or_default();
            if queue.len() >= MAX_PENDING_PER_BROWSER {
                return Err(QueueFull {
                    target: target.clone(),
                });
            }
            queue.push(tab);
        }
        self.saver.request();
        Ok(())
    }

    /// Hands over the whole queue for `target` and forgets it.
    pub fn deliver_all(&self, target: &BrowserId) -> Vec<PendingTab> {
        let delivered = self.inner.queues.write().remove(target).unwrap_or_default();
        if !delivered.is_empty() {
            self.saver.request();
        }
        delivered
    }

    pub fn queued_for(&self, target: &str) -> usize {
        self.inner.queues.read().get(target).map_or(0, Vec::len)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queues.read().values().map(Vec::len).sum()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.file.path()
    }

    pub fn relocate(&self, folder: &Path) -> Result<(), RecordError> {
        self.inner.file.relocate(folder)?;
        self.saver.flush_now()
    }

    pub fn flush(&self) -> Result<(), RecordError> {
        self.saver.flush_now()
    }
}
