//! Per-VM single-instance lock.
//!
//! The lock file is created exclusively and holds the owner's PID. A lock
//! left behind by a dead process is removed and taken over.

use crate::error::{Result, VmemError};
use crate::host;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub started_at_ms: u64,
    pub version: String,
}

impl LockOwner {
    fn current() -> Self {
        let started_at_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        Self {
            pid: std::process::id(),
            started_at_ms,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn is_alive(&self) -> bool {
        host::is_process_alive(self.pid)
    }
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owner: LockOwner,
}

impl InstanceLock {
    /// Take the lock for `vm`, or fail with `AlreadyRunning`.
    pub fn acquire(path: impl Into<PathBuf>, vm: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VmemError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        // Two attempts: the second follows removal of a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let owner = LockOwner::current();
                    let json = serde_json::to_string(&owner)
                        .map_err(|e| VmemError::Internal(e.to_string()))?;
                    if let Err(e) = file.write_all(json.as_bytes()).and_then(|_| file.sync_all()) {
                        let _ = std::fs::remove_file(&path);
                        return Err(VmemError::IoError { path, source: e });
                    }
                    info!(pid = owner.pid, path = %path.display(), "Instance lock acquired");
                    return Ok(Self { path, owner });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::read_owner(&path) {
                        Some(owner) if owner.is_alive() => {
                            return Err(VmemError::AlreadyRunning {
                                vm: vm.to_string(),
                                pid: owner.pid,
                            });
                        }
                        stale => {
                            warn!(
                                pid = stale.as_ref().map(|o| o.pid),
                                path = %path.display(),
                                "Removing stale instance lock"
                            );
                            match std::fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(VmemError::IoError { path, source: e }),
                            }
                        }
                    }
                }
                Err(e) => return Err(VmemError::IoError { path, source: e }),
            }
        }

        Err(VmemError::Internal(format!("could not take instance lock {}", path.display())))
    }

    /// Read the owner recorded in a lock file, if it parses.
    pub fn read_owner(path: &Path) -> Option<LockOwner> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Live owner of the lock at `path`, if any.
    pub fn live_owner(path: &Path) -> Option<LockOwner> {
        Self::read_owner(path).filter(LockOwner::is_alive)
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if Self::read_owner(&self.path).map(|o| o.pid) != Some(self.owner.pid) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Instance lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "Failed to remove lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmem.lock");

        let lock = InstanceLock::acquire(&path, "student-vm").unwrap();
        assert_eq!(lock.owner().pid, std::process::id());
        assert_eq!(InstanceLock::live_owner(&path).map(|o| o.pid), Some(std::process::id()));

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmem.lock");

        let _held = InstanceLock::acquire(&path, "student-vm").unwrap();
        let err = InstanceLock::acquire(&path, "student-vm").unwrap_err();
        assert!(matches!(err, VmemError::AlreadyRunning { pid, .. } if pid == std::process::id()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmem.lock");
        let stale = LockOwner { pid: i32::MAX as u32, started_at_ms: 0, version: "0.0.1".into() };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = InstanceLock::acquire(&path, "student-vm").unwrap();
        assert_eq!(lock.owner().pid, std::process::id());
    }

    #[test]
    fn test_garbage_lock_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmem.lock");
        std::fs::write(&path, "not json").unwrap();

        assert!(InstanceLock::acquire(&path, "student-vm").is_ok());
    }
}
