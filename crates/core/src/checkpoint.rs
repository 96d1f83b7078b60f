use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

mod fs;
mod memory;

pub use fs::{FsCheckpointStorage, FsLockProvider};
pub use memory::{InMemoryCheckpointStorage, InMemoryLockProvider, StorageOp};

/// Number of new entries after which the ledger persists itself.
pub const CHECKPOINT_FLUSH_THRESHOLD: usize = 100;

const TMP_SUFFIX: &str = ".TMP";
const BACKUP_SUFFIX: &str = ".TMP.OLD";
const LOCK_SUFFIX: &str = ".lock";

/// Byte-level access to wherever the checkpoint file lives.
pub trait CheckpointStorage: Send + Sync {
    /// Returns `Ok(None)` when the file does not exist.
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<Vec<u8>>>>;

    /// Creates or truncates `path` and returns only once the bytes are durable.
    fn write_synced<'a>(
        &'a self,
        path: &'a Path,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, io::Result<()>>;

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<bool>>;

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>>;

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<()>>;
}

/// Hands out exclusive locks that span processes sharing the same key.
pub trait LockProvider: Send + Sync {
    fn acquire<'a>(&'a self, key: &'a Path) -> BoxFuture<'a, io::Result<LockGuard>>;
}

/// Holds a lock until dropped.
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(held: impl Send + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

pub trait CheckpointObserver: Send + Sync {
    fn on_threshold_flush(&self, total_entries: usize);
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: BTreeSet<String>,
    pending: usize,
}

/// Durable set of completed `(identity, relative path)` upload units.
///
/// Entries are only ever added. The in-memory set is the source of truth for
/// membership; the file at `path` is rewritten in full on every flush using a
/// temp-file + backup + rename sequence under an exclusive lock, so readers
/// only ever see a complete prior or complete new set.
pub struct CheckpointStore {
    path: PathBuf,
    storage: Arc<dyn CheckpointStorage>,
    locks: Arc<dyn LockProvider>,
    observer: Option<Arc<dyn CheckpointObserver>>,
    state: Mutex<LedgerState>,
    flush_gate: tokio::sync::Mutex<()>,
}

impl CheckpointStore {
    pub fn new(
        path: impl Into<PathBuf>,
        storage: Arc<dyn CheckpointStorage>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            path: path.into(),
            storage,
            locks,
            observer: None,
            state: Mutex::new(LedgerState::default()),
            flush_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Restores the ledger from `path`, or starts empty if nothing was ever
    /// flushed there.
    ///
    /// Assumes no other process is flushing the same file concurrently.
    pub async fn open(
        path: impl Into<PathBuf>,
        storage: Arc<dyn CheckpointStorage>,
        locks: Arc<dyn LockProvider>,
    ) -> Result<Self> {
        let store = Self::new(path, storage, locks);
        let path = store.path.clone();

        let mut source = path.clone();
        let mut bytes = store
            .storage
            .read(&path)
            .await
            .map_err(|e| io_failed("read", &path, e))?;

        if bytes.is_none() {
            // A crash between moving the old file aside and renaming the new
            // one into place leaves only the backup behind.
            let backup = backup_path(&path);
            bytes = store
                .storage
                .read(&backup)
                .await
                .map_err(|e| io_failed("read", &backup, e))?;
            if bytes.is_some() {
                warn!(
                    event = "checkpoint.restore_from_backup",
                    path = %path.display(),
                    backup = %backup.display(),
                    "checkpoint.restore_from_backup"
                );
                source = backup;
            }
        }

        if let Some(bytes) = bytes {
            let entries: Vec<String> =
                serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
                    path: source.clone(),
                    message: e.to_string(),
                })?;
            store.lock_state().entries.extend(entries);
        }

        info!(
            event = "checkpoint.restore",
            path = %path.display(),
            entries = store.len(),
            "checkpoint.restore"
        );
        Ok(store)
    }

    /// Opens a ledger backed by the local filesystem.
    pub async fn open_fs(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(
            path,
            Arc::new(FsCheckpointStorage::new()),
            Arc::new(FsLockProvider::new()),
        )
        .await
    }

    pub fn with_observer(mut self, observer: Arc<dyn CheckpointObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity_key: &str, relative_path: &str) -> bool {
        self.lock_state()
            .entries
            .contains(&entry_key(identity_key, relative_path))
    }

    /// Marks a unit as complete. Every [`CHECKPOINT_FLUSH_THRESHOLD`] new
    /// entries the ledger is flushed and the observer is told the new size.
    pub async fn record_completion(&self, identity_key: &str, relative_path: &str) -> Result<()> {
        let due = {
            let mut state = self.lock_state();
            if !state.entries.insert(entry_key(identity_key, relative_path)) {
                return Ok(());
            }
            state.pending += 1;
            if state.pending >= CHECKPOINT_FLUSH_THRESHOLD {
                state.pending = 0;
                Some(state.entries.len())
            } else {
                None
            }
        };

        if let Some(total) = due {
            debug!(
                event = "checkpoint.threshold",
                path = %self.path.display(),
                entries = total,
                "checkpoint.threshold"
            );
            self.flush().await?;
            if let Some(observer) = &self.observer {
                observer.on_threshold_flush(total);
            }
        }
        Ok(())
    }

    /// Persists the complete current entry set.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        let _lock = self
            .locks
            .acquire(&self.path)
            .await
            .map_err(|e| io_failed("lock", &lock_path(&self.path), e))?;

        // Snapshot only once both are held, so waiting on another process
        // cannot leave a stale set to write.
        let entries: Vec<String> = self.lock_state().entries.iter().cloned().collect();
        let bytes = serde_json::to_vec_pretty(&entries).map_err(|e| Error::Serialization {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        self.replace_file(bytes).await?;

        debug!(
            event = "checkpoint.flush",
            path = %self.path.display(),
            entries = entries.len(),
            "checkpoint.flush"
        );
        Ok(())
    }

    async fn replace_file(&self, bytes: Vec<u8>) -> Result<()> {
        let tmp = tmp_path(&self.path);
        let backup = backup_path(&self.path);

        self.storage
            .write_synced(&tmp, bytes)
            .await
            .map_err(|e| io_failed("write", &tmp, e))?;
        let written = self
            .storage
            .exists(&tmp)
            .await
            .map_err(|e| io_failed("stat", &tmp, e))?;
        if !written {
            return Err(io_failed(
                "write",
                &tmp,
                io::Error::new(io::ErrorKind::NotFound, "temporary file missing after write"),
            ));
        }

        let had_previous = self
            .storage
            .exists(&self.path)
            .await
            .map_err(|e| io_failed("stat", &self.path, e))?;
        if had_previous {
            self.storage
                .rename(&self.path, &backup)
                .await
                .map_err(|e| io_failed("backup", &backup, e))?;
        }

        self.storage
            .rename(&tmp, &self.path)
            .await
            .map_err(|e| io_failed("rename", &self.path, e))?;

        let has_backup = self
            .storage
            .exists(&backup)
            .await
            .map_err(|e| io_failed("stat", &backup, e))?;
        if has_backup {
            self.storage
                .remove(&backup)
                .await
                .map_err(|e| io_failed("remove", &backup, e))?;
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serialized form of one checkpoint entry.
pub fn entry_key(identity_key: &str, relative_path: &str) -> String {
    format!("{identity_key}-{relative_path}")
}

pub fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, TMP_SUFFIX)
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, BACKUP_SUFFIX)
}

pub fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, LOCK_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

fn io_failed(op: &'static str, path: &Path, source: io::Error) -> Error {
    error!(
        event = "io.checkpoint.failed",
        op,
        path = %path.display(),
        error = %source,
        "io.checkpoint.failed"
    );
    Error::checkpoint_io(op, path, source)
}
