//! Keyed JSON documents on disk.
//!
//! Both stores persist a single JSON object keyed by browser id. Writes go
//! to a `.tmp` sibling first and are renamed over the target, so a crash in
//! the middle of a write leaves the previous file intact.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Quiet period between the first save request and the write.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

pub type Document = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode {path:?}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A JSON document living at `<folder>/<file_name>`; the folder can move.
///
/// Writers are serialized: a save takes its snapshot and renames the file
/// while holding `writer`, so the last snapshot taken is the one on disk.
pub struct RecordFile {
    folder: RwLock<PathBuf>,
    file_name: &'static str,
    writer: Mutex<()>,
}

impl RecordFile {
    pub fn new(folder: impl Into<PathBuf>, file_name: &'static str) -> Self {
        Self {
            folder: RwLock::new(folder.into()),
            file_name,
            writer: Mutex::new(()),
        }
    }

    pub fn folder(&self) -> PathBuf {
        self.folder.read().clone()
    }

    pub fn path(&self) -> PathBuf {
        self.folder.read().join(self.file_name)
    }

    /// Reads the document. A missing file is an empty document, and so is a
    /// corrupt one (after a warning).
    pub fn load(&self) -> Result<Document, RecordError> {
        let folder = self.folder();
        std::fs::create_dir_all(&folder).map_err(|source| RecordError::Write {
            path: folder.clone(),
            source,
        })?;
        load_document(&self.path())
    }

    pub fn save<T: Serialize>(&self, document: &T) -> Result<(), RecordError> {
        self.save_with(|| document)
    }

    /// Takes the snapshot to write under the write guard. `snapshot` may
    /// lock the owning store but must not block on I/O.
    pub fn save_with<T, F>(&self, snapshot: F) -> Result<(), RecordError>
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        let _writing = self.writer.lock();
        let document = snapshot();
        let path = self.path();
        let bytes = serde_json::to_vec_pretty(&document).map_err(|source| RecordError::Encode {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
    }

    /// Points the record at `new_folder`, moving the existing file along when
    /// possible. A failed move is logged; the caller writes fresh state at the
    /// new location afterwards either way.
    pub fn relocate(&self, new_folder: &Path) -> Result<(), RecordError> {
        std::fs::create_dir_all(new_folder).map_err(|source| RecordError::Write {
            path: new_folder.to_path_buf(),
            source,
        })?;

        let _writing = self.writer.lock();
        let old_path = {
            let mut folder = self.folder.write();
            let old_path = folder.join(self.file_name);
            *folder = new_folder.to_path_buf();
            old_path
        };
        let new_path = self.path();

        if old_path != new_path && old_path.exists() {
            if let Err(err) = std::fs::rename(&old_path, &new_path) {
                warn!(
                    from = %old_path.display(),
                    to = %new_path.display(),
                    error = %err,
                    "could not move {}; writing fresh state instead",
                    self.file_name
                );
            }
        }
        Ok(())
    }
}

pub fn load_document(path: &Path) -> Result<Document, RecordError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Document::new()),
        Err(source) => {
            return Err(RecordError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_slice::<Document>(&bytes) {
        Ok(document) => Ok(document),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt document, starting fresh");
            Ok(Document::new())
        }
    }
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let write_err = |source| RecordError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}

type FlushFn = dyn Fn() -> Result<(), RecordError> + Send + Sync;

struct SaveSignal {
    dirty: AtomicBool,
    wake: Notify,
}

/// Coalesces save requests into one write per quiet period.
///
/// `request` only flips a dirty flag; the background task sleeps for the
/// quiet period after being woken, clears the flag and runs the flush once.
/// Requests that arrive while the task sleeps ride along with that write.
pub struct SaveScheduler {
    label: &'static str,
    signal: Arc<SaveSignal>,
    flush: Arc<FlushFn>,
    worker: JoinHandle<()>,
}

impl SaveScheduler {
    pub fn spawn<F>(label: &'static str, quiet: Duration, flush: F) -> Self
    where
        F: Fn() -> Result<(), RecordError> + Send + Sync + 'static,
    {
        let signal = Arc::new(SaveSignal {
            dirty: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let flush: Arc<FlushFn> = Arc::new(flush);

        let worker_signal = Arc::clone(&signal);
        let worker_flush = Arc::clone(&flush);
        let worker = tokio::spawn(async move {
            loop {
                worker_signal.wake.notified().await;
                tokio::time::sleep(quiet).await;
                if !worker_signal.dirty.swap(false, Ordering::AcqRel) {
                    continue;
                }
                let flush = Arc::clone(&worker_flush);
                match tokio::task::spawn_blocking(move || flush()).await {
                    Ok(Ok(())) => debug!(store = label, "debounced save complete"),
                    Ok(Err(err)) => error!(store = label, error = %err, "debounced save failed"),
                    Err(err) => error!(store = label, error = %err, "debounced save task panicked"),
                }
            }
        });

        Self {
            label,
            signal,
            flush,
            worker,
        }
    }

    pub fn request(&self) {
        if !self.signal.dirty.swap(true, Ordering::AcqRel) {
            self.signal.wake.notify_one();
        }
    }

    /// Writes right away, absorbing any pending request.
    pub fn flush_now(&self) -> Result<(), RecordError> {
        self.signal.dirty.store(false, Ordering::Release);
        let result = (self.flush)();
        if let Err(err) = &result {
            error!(store = self.label, error = %err, "save failed");
        }
        result
    }
}

impl Drop for SaveScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test_timeout::timeout]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let record = RecordFile::new(dir.path(), "tabs.json");
        assert!(record.load().unwrap().is_empty());
    }

    #[test_timeout::timeout]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tabs.json"), b"{ not json").unwrap();
        let record = RecordFile::new(dir.path(), "tabs.json");
        assert!(record.load().unwrap().is_empty());
    }

    #[test_timeout::timeout]
    fn save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let record = RecordFile::new(dir.path(), "doc.json");
        let mut doc = Document::new();
        doc.insert("a".into(), serde_json::json!({"n": 1}));
        record.save(&doc).unwrap();
        doc.insert("b".into(), serde_json::json!({"n": 2}));
        record.save(&doc).unwrap();

        assert_eq!(record.load().unwrap(), doc);
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test_timeout::timeout]
    fn overlapping_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let record = Arc::new(RecordFile::new(dir.path(), "doc.json"));

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let record = Arc::clone(&record);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        record
                            .save(&serde_json::json!({"writer": writer, "n": n}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let doc = record.load().unwrap();
        assert_eq!(doc["n"], 199);
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test_timeout::timeout]
    fn relocate_moves_the_file() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let target = new.path().join("nested");
        let record = RecordFile::new(old.path(), "doc.json");
        record.save(&serde_json::json!({"k": true})).unwrap();

        record.relocate(&target).unwrap();

        assert!(!old.path().join("doc.json").exists());
        assert!(target.join("doc.json").exists());
        assert_eq!(record.folder(), target);
    }

    #[test_timeout::tokio_timeout_test]
    async fn bursts_of_requests_coalesce_into_one_write() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes);
        let scheduler = SaveScheduler::spawn("test", Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..20 {
            scheduler.request();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        scheduler.request();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_now_absorbs_a_pending_request() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes);
        let scheduler = SaveScheduler::spawn("test", Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scheduler.request();
        scheduler.flush_now().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }
}
