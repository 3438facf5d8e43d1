//! Exclusive per-repository lock
//!
//! Held for the whole of any operation that writes objects or state (commit,
//! push or pull application, archive changes, gc). The lock lives at
//! `<repo>/lock` and uses an OS advisory lock via `fs2`, so it also excludes
//! other processes. It is released when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{FoxError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    file: Option<File>,
}

impl RepoLock {
    /// Block until the lock is free. With a timeout, give up with
    /// [`FoxError::LockTimeout`] once it has elapsed.
    pub fn acquire(repo_path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let path = Self::lock_path(repo_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = started.elapsed();
                    if timeout.is_some_and(|limit| waited >= limit) {
                        return Err(FoxError::LockTimeout { path, waited });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Acquired {:?} after {:?}", path, started.elapsed());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Non-blocking attempt; `None` if someone else holds it
    pub fn try_acquire(repo_path: &Path) -> Result<Option<Self>> {
        match Self::acquire(repo_path, Some(Duration::ZERO)) {
            Ok(lock) => Ok(Some(lock)),
            Err(FoxError::LockTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(repo_path: &Path) -> PathBuf {
        repo_path.join("lock")
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!("Failed to release {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let lock = RepoLock::acquire(tmp.path(), None).unwrap();
        assert!(lock.is_held());
        assert!(RepoLock::try_acquire(tmp.path()).unwrap().is_none());

        drop(lock);
        assert!(RepoLock::try_acquire(tmp.path()).unwrap().is_some());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let tmp = TempDir::new().unwrap();
        let _held = RepoLock::acquire(tmp.path(), None).unwrap();

        let err = RepoLock::acquire(tmp.path(), Some(Duration::from_millis(50))).unwrap_err();
        match err {
            FoxError::LockTimeout { waited, .. } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let tmp = TempDir::new().unwrap();
        let held = RepoLock::acquire(tmp.path(), None).unwrap();
        let path = tmp.path().to_path_buf();
        let (tx, rx) = mpsc::channel();

        let waiter = thread::spawn(move || {
            let lock = RepoLock::acquire(&path, Some(Duration::from_secs(5))).unwrap();
            tx.send(()).unwrap();
            drop(lock);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        drop(held);
        waiter.join().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_locks_are_per_repository() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let _lock_a = RepoLock::acquire(a.path(), None).unwrap();
        assert!(RepoLock::try_acquire(b.path()).unwrap().is_some());
    }
}
