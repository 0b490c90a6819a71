//! Advisory file locks for processes on one machine.
//!
//! Each named lock is an exclusive `fs2` lock on `<dir>/<name>.lock`. The
//! operating system drops the lock when the owning process exits, so a crashed
//! owner never wedges the election.

use super::traits::{LockGuard, LockService};
use crate::error::{HubShareError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock service backed by lock files in one directory.
#[derive(Debug, Clone)]
pub struct FileLockService {
    dir: PathBuf,
}

impl FileLockService {
    /// Use `dir` for lock files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| HubShareError::io_with_path(e, &dir))?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.lock", file_name))
    }

    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| HubShareError::io_with_path(e, path))
    }
}

struct HeldFile(File);

impl Drop for HeldFile {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

#[async_trait::async_trait]
impl LockService for FileLockService {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let path = self.lock_path(name);
        let file = Self::open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired lock file {}", path.display());
                Ok(Some(LockGuard::new(name, HeldFile(file))))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(HubShareError::Lock {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let path = self.lock_path(name);
        let lock_name = name.to_string();
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            let file = Self::open(&path)?;
            file.lock_exclusive().map_err(|e| HubShareError::Lock {
                name: lock_name,
                message: e.to_string(),
            })?;
            Ok(file)
        })
        .await
        .map_err(|e| HubShareError::Lock {
            name: name.to_string(),
            message: format!("lock task failed: {}", e),
        })??;

        Ok(LockGuard::new(name, HeldFile(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_try_acquire_is_exclusive_across_handles() {
        let temp_dir = TempDir::new().unwrap();
        let first = FileLockService::new(temp_dir.path().join("locks")).unwrap();
        let second = FileLockService::new(temp_dir.path().join("locks")).unwrap();

        let guard = first.try_acquire("hubshare_v1_election").unwrap();
        assert!(guard.is_some());
        assert!(second.try_acquire("hubshare_v1_election").unwrap().is_none());

        drop(guard);
        assert!(second.try_acquire("hubshare_v1_election").unwrap().is_some());
    }

    #[test]
    fn test_lock_names_are_sanitized() {
        let temp_dir = TempDir::new().unwrap();
        let locks = FileLockService::new(temp_dir.path()).unwrap();
        let path = locks.lock_path("ns/with:odd chars");
        assert_eq!(path.file_name().unwrap(), "ns_with_odd_chars.lock");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acquire_waits_for_release() {
        let temp_dir = TempDir::new().unwrap();
        let locks = FileLockService::new(temp_dir.path()).unwrap();
        let other = locks.clone();

        let guard = locks.try_acquire("state").unwrap().unwrap();
        let waiter = tokio::spawn(async move { other.acquire("state").await.is_ok() });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let acquired = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired);
    }
}
