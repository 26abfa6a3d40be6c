use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::Error;

/// Serializes restores against other lock-aware agents.
#[derive(Clone, Debug)]
pub enum Lock {
    /// `iptables-restore` takes the in-kernel xtables lock itself via
    /// `--wait`; nothing to do here.
    Native,
    /// Pre-1.6.2 restores race; hold the shared lock file for the duration
    /// of the apply.
    File(SharedLock),
}

impl Lock {
    pub fn acquire(&self) -> Result<Option<LockGuard>, Error> {
        match self {
            Lock::Native => Ok(None),
            Lock::File(lock) => lock.acquire().map(Some),
        }
    }
}

/// The xtables lock file shared with iptables itself and other agents,
/// acquired by polling at a fixed probe interval up to a timeout.
#[derive(Clone, Debug)]
pub struct SharedLock {
    path: PathBuf,
    timeout: Duration,
    probe_interval: Duration,
}

impl SharedLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            probe_interval,
        }
    }

    pub fn acquire(&self) -> Result<LockGuard, Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| Error::LockFile {
                path: self.path.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!(path = ?self.path, "acquired xtables lock");
                    return Ok(LockGuard { file });
                }
                Err(std::fs::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout);
                    }
                    std::thread::sleep(self.probe_interval);
                }
                Err(std::fs::TryLockError::Error(source)) => {
                    return Err(Error::LockFile {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

/// Holds the lock file; released on drop.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
