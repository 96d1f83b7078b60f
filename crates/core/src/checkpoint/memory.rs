use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use super::{CheckpointStorage, LockGuard, LockProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Exists,
    Rename,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: StorageOp,
    skip: usize,
}

#[derive(Debug, Default)]
struct MemoryFs {
    files: HashMap<PathBuf, Vec<u8>>,
    ops: Vec<(StorageOp, PathBuf)>,
    fault: Option<Fault>,
}

impl MemoryFs {
    fn begin(&mut self, op: StorageOp, path: &Path) -> io::Result<()> {
        self.ops.push((op, path.to_path_buf()));
        let Some(fault) = self.fault.as_mut() else {
            return Ok(());
        };
        if fault.op != op {
            return Ok(());
        }
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        self.fault = None;
        Err(io::Error::other(format!(
            "injected {op:?} failure on {}",
            path.display()
        )))
    }
}

/// Checkpoint storage held in a map, with a call log and one-shot fault
/// injection for exercising partial flushes.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStorage {
    inner: Mutex<MemoryFs>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.fs().files.insert(path.into(), bytes);
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.fs().files.get(path).cloned()
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.fs().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Fails the `skip + 1`-th call of `op` made from now on, then disarms.
    pub fn inject_fault(&self, op: StorageOp, skip: usize) {
        self.fs().fault = Some(Fault { op, skip });
    }

    pub fn ops(&self) -> Vec<(StorageOp, PathBuf)> {
        self.fs().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.fs().ops.clear();
    }

    fn fs(&self) -> MutexGuard<'_, MemoryFs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let mut fs = self.fs();
            fs.begin(StorageOp::Read, path)?;
            Ok(fs.files.get(path).cloned())
        })
    }

    fn write_synced<'a>(
        &'a self,
        path: &'a Path,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut fs = self.fs();
            fs.begin(StorageOp::Write, path)?;
            fs.files.insert(path.to_path_buf(), bytes);
            Ok(())
        })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<bool>> {
        Box::pin(async move {
            let mut fs = self.fs();
            fs.begin(StorageOp::Exists, path)?;
            Ok(fs.files.contains_key(path))
        })
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut fs = self.fs();
            fs.begin(StorageOp::Rename, from)?;
            let bytes = fs.files.remove(from).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{}", from.display()))
            })?;
            fs.files.insert(to.to_path_buf(), bytes);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut fs = self.fs();
            fs.begin(StorageOp::Remove, path)?;
            fs.files.remove(path).map(|_| ()).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display()))
            })
        })
    }
}

/// Process-local lock provider that tracks how many guards are live.
#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    held: Arc<AtomicUsize>,
    acquired: AtomicUsize,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

struct HeldMemoryLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    held: Arc<AtomicUsize>,
}

impl Drop for HeldMemoryLock {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LockProvider for InMemoryLockProvider {
    fn acquire<'a>(&'a self, key: &'a Path) -> BoxFuture<'a, io::Result<LockGuard>> {
        Box::pin(async move {
            let mutex = self
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.to_path_buf())
                .or_default()
                .clone();
            let guard = mutex.lock_owned().await;
            self.held.fetch_add(1, Ordering::SeqCst);
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(LockGuard::new(HeldMemoryLock {
                _guard: guard,
                held: self.held.clone(),
            }))
        })
    }
}
