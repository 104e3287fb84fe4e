//! Advisory lock file guarding the registration transaction
//!
//! The lock is an `flock`-style exclusive lock (via `fs2`) on a dedicated
//! file. Acquisition polls until a deadline so a stuck holder turns into a
//! `LockTimeout` error instead of a hung request. Each acquisition opens its
//! own file handle, so two threads of the same process exclude each other too.

use crate::error::{RegistryError, RegistryResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Default bound on lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lock file plus acquisition policy
#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct StateLockGuard {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> RegistryResult<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RegistryError::io(
                    format!("failed to create lock directory {}", parent.display()),
                    e,
                )
            })?;
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                RegistryError::io(
                    format!("failed to open lock file {}", self.path.display()),
                    e,
                )
            })
    }

    /// Try once without waiting
    pub fn try_acquire(&self) -> RegistryResult<Option<StateLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StateLockGuard {
                file,
                path: self.path.clone(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(RegistryError::io(
                format!("failed to lock {}", self.path.display()),
                e,
            )),
        }
    }

    /// Block until the lock is held or the timeout elapses
    pub fn acquire(&self) -> RegistryResult<StateLockGuard> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                trace!(
                    "Acquired {} after {:?}",
                    self.path.display(),
                    start.elapsed()
                );
                return Ok(guard);
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                warn!(
                    "Gave up waiting for {} after {:?}",
                    self.path.display(),
                    waited
                );
                return Err(RegistryError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL.min(self.timeout - waited));
        }
    }
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release {}: {}", self.path.display(), e);
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
        let dir = TempDir::new().unwrap();
        let lock = StateLock::new(dir.path().join("registry.lock"), Duration::from_secs(1));

        let guard = lock.acquire().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());
        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn test_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let lock = StateLock::new(dir.path().join("registry.lock"), Duration::from_millis(100));

        let _held = lock.acquire().unwrap();
        let start = Instant::now();
        let result = lock.acquire();

        assert!(matches!(result, Err(RegistryError::LockTimeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let dir = TempDir::new().unwrap();
        let lock = StateLock::new(dir.path().join("registry.lock"), Duration::from_secs(5));
        let held = lock.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || {
                let guard = lock.acquire();
                tx.send(guard.is_ok()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let lock = StateLock::new(
            dir.path().join("state").join("registry.lock"),
            Duration::from_secs(1),
        );
        assert!(lock.acquire().is_ok());
        assert!(dir.path().join("state").join("registry.lock").exists());
    }
}
