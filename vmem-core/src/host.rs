//! Host probes: physical memory and process liveness.

use crate::error::{Result, VmemError};
use std::path::Path;

/// Total physical memory of the host in bytes.
pub fn total_memory_bytes() -> Result<u64> {
    // SAFETY: sysconf only reads process-independent constants.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };

    if pages <= 0 || page_size <= 0 {
        return Err(VmemError::Internal("sysconf could not report physical memory".into()));
    }
    Ok(pages as u64 * page_size as u64)
}

/// Check whether a process exists.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // kill(pid, 0) performs the permission and existence checks without
    // delivering a signal. EPERM still means the process exists.
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            return true;
        }
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Read a pid file and report whether its process is alive.
///
/// Missing or unparsable files count as "not running".
pub fn pid_file_alive(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(is_process_alive)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_memory_is_positive() {
        let total = total_memory_bytes().unwrap();
        assert!(total > 0);
    }

    #[test]
    fn test_own_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        assert!(!pid_file_alive(&path));

        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(pid_file_alive(&path));

        std::fs::write(&path, "garbage").unwrap();
        assert!(!pid_file_alive(&path));
    }
}
