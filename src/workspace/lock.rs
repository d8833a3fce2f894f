use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::{FlowError, FlowResult};

/// Serializes trunk mutation: an in-process mutex for flows sharing this
/// manager, plus an advisory lock on `.forge/trunk.lock` for other processes.
#[derive(Clone)]
pub struct TrunkLock {
    path: PathBuf,
    local: Arc<Mutex<()>>,
}

/// Held for the duration of one merge. Both locks are released on drop.
pub struct TrunkGuard {
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl TrunkLock {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            local: Arc::new(Mutex::new(())),
        }
    }

    pub async fn acquire(&self) -> FlowResult<TrunkGuard> {
        let local = self.local.clone().lock_owned().await;
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| FlowError::Other(anyhow::anyhow!("trunk lock task panicked: {}", e)))??;
        tracing::debug!(path = %self.path.display(), "trunk lock acquired");
        Ok(TrunkGuard {
            file,
            _local: local,
        })
    }
}

impl Drop for TrunkGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release trunk lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let lock = TrunkLock::new(&dir.path().join(".forge/trunk.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_locks_on_same_file_exclude_each_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunk.lock");
        let a = TrunkLock::new(&path);
        let b = TrunkLock::new(&path);

        let guard = a.acquire().await.unwrap();
        let pending = tokio::spawn(async move { b.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        drop(guard);
        pending.await.unwrap().unwrap();
    }
}
