//! Centralized path configuration.
//!
//! All per-VM files (monitor socket, telemetry record, persisted state,
//! instance lock) are resolved here so the daemon and the status commands
//! agree on locations.

use std::path::{Path, PathBuf};

/// Name of the VM that lives directly in the data directory.
pub const DEFAULT_VM_NAME: &str = "student-vm";

/// File name of the guest-written memory status record.
pub const STATUS_FILE_NAME: &str = ".vm-memory-status";

/// Get the base data directory.
///
/// Resolution order:
/// 1. `VMEM_DATA_DIR` environment variable
/// 2. `~/.vm`
/// 3. `/var/lib/vmem` when no home directory is known
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMEM_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".vm")).unwrap_or_else(|| PathBuf::from("/var/lib/vmem"))
}

/// Get the configuration directory.
///
/// `VMEM_CONFIG_DIR` wins, then the platform config dir (`~/.config/vmem`).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMEM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("vmem")).unwrap_or_else(|| data_dir().join("config"))
}

/// Paths for a single VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    name: String,
    vm_dir: PathBuf,
}

impl VmPaths {
    /// Resolve paths for `name` under an explicit base directory.
    ///
    /// The default VM uses the base directory itself; every other VM gets a
    /// subdirectory named after it.
    pub fn new(base: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        let base = base.as_ref();
        let vm_dir = if name == DEFAULT_VM_NAME { base.to_path_buf() } else { base.join(&name) };
        Self { name, vm_dir }
    }

    /// Resolve paths for `name` under [`data_dir`].
    pub fn for_vm(name: impl Into<String>) -> Self {
        Self::new(data_dir(), name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vm_dir(&self) -> &Path {
        &self.vm_dir
    }

    /// QMP monitor socket exposed by the hypervisor.
    pub fn monitor_socket(&self) -> PathBuf {
        self.vm_dir.join(format!("{}-monitor.sock", self.name))
    }

    /// PID file written by the hypervisor process.
    pub fn vm_pid_file(&self) -> PathBuf {
        self.vm_dir.join(format!("{}.pid", self.name))
    }

    /// Host side of the shared folder mounted in the guest.
    pub fn shared_dir(&self) -> PathBuf {
        self.vm_dir.join("data")
    }

    /// Guest-written memory status record.
    pub fn status_file(&self) -> PathBuf {
        self.shared_dir().join(STATUS_FILE_NAME)
    }

    /// SQLite database holding the controller state.
    pub fn state_db(&self) -> PathBuf {
        self.vm_dir.join("vmem-state.db")
    }

    /// Single-instance lock for the controller.
    pub fn lock_file(&self) -> PathBuf {
        self.vm_dir.join("vmem.lock")
    }

    /// Controller log file (used when running detached).
    pub fn log_file(&self) -> PathBuf {
        self.vm_dir.join("vmem.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vm_uses_base_dir() {
        let paths = VmPaths::new("/tmp/vmem-test", DEFAULT_VM_NAME);
        assert_eq!(paths.vm_dir(), Path::new("/tmp/vmem-test"));
        assert_eq!(
            paths.monitor_socket(),
            PathBuf::from("/tmp/vmem-test/student-vm-monitor.sock")
        );
    }

    #[test]
    fn test_named_vm_uses_subdir() {
        let paths = VmPaths::new("/tmp/vmem-test", "lab");
        assert_eq!(paths.vm_dir(), Path::new("/tmp/vmem-test/lab"));
        assert_eq!(paths.status_file(), PathBuf::from("/tmp/vmem-test/lab/data/.vm-memory-status"));
        assert_eq!(paths.lock_file(), PathBuf::from("/tmp/vmem-test/lab/vmem.lock"));
    }

    #[test]
    fn test_paths_consistency() {
        let paths = VmPaths::new("/srv/vms", "build-box");
        let base = paths.vm_dir().to_path_buf();
        assert!(paths.state_db().starts_with(&base));
        assert!(paths.lock_file().starts_with(&base));
        assert!(paths.vm_pid_file().starts_with(&base));
        assert!(paths.status_file().starts_with(paths.shared_dir()));
    }
}
