use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use futures::future::BoxFuture;

use super::{CheckpointStorage, LockGuard, LockProvider, lock_path};

/// Local filesystem storage. Blocking calls run on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCheckpointStorage;

impl FsCheckpointStorage {
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointStorage for FsCheckpointStorage {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<Vec<u8>>>> {
        let path = path.to_path_buf();
        Box::pin(blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }))
    }

    fn write_synced<'a>(
        &'a self,
        path: &'a Path,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, io::Result<()>> {
        let path = path.to_path_buf();
        Box::pin(blocking(move || {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            Ok(())
        }))
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<bool>> {
        let path = path.to_path_buf();
        Box::pin(blocking(move || path.try_exists()))
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        let from = from.to_path_buf();
        let to = to.to_path_buf();
        Box::pin(blocking(move || std::fs::rename(&from, &to)))
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        let path = path.to_path_buf();
        Box::pin(blocking(move || std::fs::remove_file(&path)))
    }
}

/// Advisory `flock`-style locks on a `<key>.lock` sentinel next to the key.
///
/// The sentinel is left in place after release.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLockProvider;

impl FsLockProvider {
    pub fn new() -> Self {
        Self
    }
}

impl LockProvider for FsLockProvider {
    fn acquire<'a>(&'a self, key: &'a Path) -> BoxFuture<'a, io::Result<LockGuard>> {
        let sentinel = lock_path(key);
        Box::pin(blocking(move || {
            if let Some(parent) = sentinel.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&sentinel)?;
            // Blocks until any other holder, in this or another process, lets go.
            fs2::FileExt::lock_exclusive(&file)?;
            Ok(LockGuard::new(HeldFileLock { file }))
        }))
    }
}

struct HeldFileLock {
    file: File,
}

impl Drop for HeldFileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(format!("spawn_blocking failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn read_of_missing_file_is_none() {
        let temp = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new();
        let got = storage.read(&temp.path().join("missing.json")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn write_rename_remove_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let storage = FsCheckpointStorage::new();
        let a = temp.path().join("nested").join("a.json");
        let b = temp.path().join("nested").join("b.json");

        storage.write_synced(&a, b"[]".to_vec()).await.unwrap();
        assert!(storage.exists(&a).await.unwrap());

        storage.rename(&a, &b).await.unwrap();
        assert!(!storage.exists(&a).await.unwrap());
        assert_eq!(storage.read(&b).await.unwrap().unwrap(), b"[]");

        storage.remove(&b).await.unwrap();
        assert!(!storage.exists(&b).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_holder_waits_for_release() {
        let temp = tempfile::tempdir().unwrap();
        let key = temp.path().join("ckpt.json");
        let locks = Arc::new(FsLockProvider::new());

        let first = locks.acquire(&key).await.unwrap();
        assert!(lock_path(&key).exists());

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let _second = locks.acquire(&key).await.unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        waiter.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
