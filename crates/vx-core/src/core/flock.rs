//! Cross-process advisory lock over the installation root. Held only during
//! filesystem-mutation phases; resolve and network phases run unlocked.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::fsutil;

pub const LOCK_FILE_NAME: &str = ".vx.lock";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub operation: String,
    pub acquired_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("[VX201] installation root is locked by pid {pid} ({operation}, since {acquired_at})")]
    Locked {
        pid: u32,
        operation: String,
        acquired_at: String,
    },
    #[error("[VX200] failed to prepare lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive lock on the installation root. Released on drop.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Acquire the lock, polling until `timeout` expires. On expiry the
    /// current holder (best effort) is reported in the error.
    pub fn acquire(root: &Path, operation: &str, timeout: Duration) -> Result<Self, LockError> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE_NAME);
        let deadline = Instant::now() + timeout;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let holder = LockHolder {
                        pid: std::process::id(),
                        operation: operation.to_string(),
                        acquired_at: fsutil::timestamp_rfc3339(),
                    };
                    let mut file = file;
                    file.set_len(0)?;
                    let payload =
                        serde_json::to_string(&holder).unwrap_or_else(|_| String::from("{}"));
                    file.write_all(payload.as_bytes())?;
                    file.flush()?;
                    debug!(path = %path.display(), operation, "acquired install lock");
                    return Ok(Self { file, path });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        let holder = read_holder(&path);
                        return Err(LockError::Locked {
                            pid: holder.as_ref().map_or(0, |h| h.pid),
                            operation: holder
                                .as_ref()
                                .map_or_else(|| "unknown".to_string(), |h| h.operation.clone()),
                            acquired_at: holder
                                .map_or_else(|| "unknown".to_string(), |h| h.acquired_at),
                        });
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => return Err(LockError::Io(err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "released install lock");
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_reacquire_after_drop() {
        let temp = tempfile::tempdir().unwrap();
        let lock = InstallLock::acquire(temp.path(), "install", Duration::from_secs(1)).unwrap();
        drop(lock);
        let again = InstallLock::acquire(temp.path(), "revert", Duration::from_secs(1));
        assert!(again.is_ok());
    }

    #[test]
    fn contention_reports_holder() {
        let temp = tempfile::tempdir().unwrap();
        let _held = InstallLock::acquire(temp.path(), "install", Duration::from_secs(1)).unwrap();
        let err = InstallLock::acquire(temp.path(), "prune", Duration::from_millis(250))
            .expect_err("second lock must fail");
        match err {
            LockError::Locked { pid, operation, .. } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(operation, "install");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
