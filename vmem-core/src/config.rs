//! Configuration management.

use crate::error::{Result, VmemError};
use crate::ledger::MemoryBudget;
use crate::paths::{self, VmPaths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// DIMM sizes must be aligned to the largest page size the guest may use.
const DIMM_ALIGNMENT_MB: u64 = 2;

/// Which telemetry field counts as "free" when computing pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// `free_kb`: memory the guest kernel has not touched at all.
    #[default]
    Free,
    /// `available_kb`: free plus reclaimable page cache.
    Available,
}

/// Lowest target a shrink may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShrinkFloor {
    /// Never shrink below the boot-time allocation.
    #[default]
    Initial,
    /// Allow shrinking down to `min_memory_mb`.
    Minimum,
}

/// Controller configuration for one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub initial_memory_mb: u64,
    pub min_memory_mb: u64,
    /// Defaults to host total minus `reserved_host_mb`.
    pub max_memory_mb: Option<u64>,
    pub reserved_host_mb: u64,
    pub chunk_size_mb: u64,
    pub max_slots: usize,
    pub poll_interval_secs: u64,
    pub low_watermark: f64,
    pub high_watermark: f64,
    pub command_timeout_secs: u64,
    pub stale_after_polls: u32,
    pub cooldown_polls: u32,
    pub memory_source: MemorySource,
    pub shrink_floor: ShrinkFloor,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub vm_check_every_polls: u32,
    pub metrics_port: Option<u16>,
    pub monitor_socket: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub vm_pid_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_memory_mb: 2048,
            min_memory_mb: 1024,
            max_memory_mb: None,
            reserved_host_mb: 1024,
            chunk_size_mb: 1024,
            max_slots: 16,
            poll_interval_secs: 5,
            low_watermark: 0.30,
            high_watermark: 0.50,
            command_timeout_secs: 5,
            stale_after_polls: 3,
            cooldown_polls: 2,
            memory_source: MemorySource::Free,
            shrink_floor: ShrinkFloor::Initial,
            reconnect_initial_backoff_ms: 1000,
            reconnect_max_backoff_ms: 30_000,
            vm_check_every_polls: 3,
            metrics_port: None,
            monitor_socket: None,
            status_file: None,
            vm_pid_file: None,
        }
    }
}

impl ControllerConfig {
    /// Default location of the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("vmem.json")
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit file. A missing file is an error here.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| VmemError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| VmemError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Age after which a telemetry record no longer reflects the guest.
    pub fn stale_after(&self) -> Duration {
        self.poll_interval().checked_mul(self.stale_after_polls).unwrap_or(Duration::MAX)
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(MIB)
    }

    pub fn monitor_socket(&self, paths: &VmPaths) -> PathBuf {
        self.monitor_socket.clone().unwrap_or_else(|| paths.monitor_socket())
    }

    pub fn status_file(&self, paths: &VmPaths) -> PathBuf {
        self.status_file.clone().unwrap_or_else(|| paths.status_file())
    }

    pub fn vm_pid_file(&self, paths: &VmPaths) -> PathBuf {
        self.vm_pid_file.clone().unwrap_or_else(|| paths.vm_pid_file())
    }

    /// Validate against the host and resolve the memory bounds.
    ///
    /// The returned budget starts with `current_target_bytes == initial`.
    pub fn validate(&self, host_total_bytes: u64) -> Result<MemoryBudget> {
        let invalid = |reason: String| Err(VmemError::InvalidConfig { reason });

        if self.chunk_size_mb == 0 || self.max_slots == 0 || self.poll_interval_secs == 0 {
            return invalid("chunk_size_mb, max_slots and poll_interval_secs must be non-zero".into());
        }
        if self.command_timeout_secs == 0 {
            return invalid("command_timeout_secs must be non-zero".into());
        }
        if self.chunk_size_mb % DIMM_ALIGNMENT_MB != 0 {
            return invalid(format!(
                "chunk_size_mb ({}) must be a multiple of {} MiB",
                self.chunk_size_mb, DIMM_ALIGNMENT_MB
            ));
        }
        if !(self.low_watermark > 0.0 && self.high_watermark < 1.0) {
            return invalid(format!(
                "watermarks must lie in (0, 1), got low={} high={}",
                self.low_watermark, self.high_watermark
            ));
        }
        if self.low_watermark >= self.high_watermark {
            return invalid(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            ));
        }
        if self.poll_interval().checked_mul(self.stale_after_polls).is_none() {
            return invalid(format!(
                "poll_interval_secs ({}) * stale_after_polls ({}) overflows",
                self.poll_interval_secs, self.stale_after_polls
            ));
        }
        if self.reconnect_initial_backoff_ms == 0
            || self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms
        {
            return invalid("reconnect backoff must satisfy 0 < initial <= max".into());
        }

        mib_to_bytes("chunk_size_mb", self.chunk_size_mb)?;
        let reserved_bytes = mib_to_bytes("reserved_host_mb", self.reserved_host_mb)?;
        let host_limit = host_total_bytes.saturating_sub(reserved_bytes);
        let max_bytes = match self.max_memory_mb {
            Some(mb) => mib_to_bytes("max_memory_mb", mb)?,
            None => host_limit,
        };
        let min_bytes = mib_to_bytes("min_memory_mb", self.min_memory_mb)?;
        let initial_bytes = mib_to_bytes("initial_memory_mb", self.initial_memory_mb)?;

        if max_bytes > host_limit {
            return invalid(format!(
                "max_memory_mb ({}) exceeds host memory minus reserve ({} MiB)",
                max_bytes / MIB,
                host_limit / MIB
            ));
        }
        if !(min_bytes <= initial_bytes && initial_bytes <= max_bytes) {
            return invalid(format!(
                "memory bounds must satisfy min <= initial <= max, got {} / {} / {} MiB",
                min_bytes / MIB,
                initial_bytes / MIB,
                max_bytes / MIB
            ));
        }

        Ok(MemoryBudget::new(initial_bytes, min_bytes, max_bytes))
    }
}

fn mib_to_bytes(field: &str, mb: u64) -> Result<u64> {
    mb.checked_mul(MIB).ok_or_else(|| VmemError::InvalidConfig {
        reason: format!("{} ({}) is too large", field, mb),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: u64 = 16 * GIB;

    #[test]
    fn test_defaults_validate() {
        let config = ControllerConfig::default();
        let budget = config.validate(HOST).unwrap();
        assert_eq!(budget.initial_bytes, 2 * GIB);
        assert_eq!(budget.min_bytes, GIB);
        assert_eq!(budget.max_bytes, 15 * GIB);
        assert_eq!(budget.current_target_bytes, budget.initial_bytes);
        assert_eq!(config.stale_after(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"chunk_size_mb": 512, "memory_source": "available"}"#).unwrap();
        assert_eq!(config.chunk_size_mb, 512);
        assert_eq!(config.memory_source, MemorySource::Available);
        assert_eq!(config.max_slots, 16);
        assert_eq!(config.shrink_floor, ShrinkFloor::Initial);
    }

    #[test]
    fn test_max_above_host_rejected() {
        let config = ControllerConfig { max_memory_mb: Some(16 * 1024), ..Default::default() };
        let err = config.validate(HOST).unwrap_err();
        assert!(matches!(err, VmemError::InvalidConfig { .. }));
    }

    #[test]
    fn test_bounds_order_rejected() {
        let config =
            ControllerConfig { initial_memory_mb: 512, min_memory_mb: 1024, ..Default::default() };
        assert!(config.validate(HOST).is_err());
    }

    #[test]
    fn test_watermarks_rejected() {
        let inverted =
            ControllerConfig { low_watermark: 0.6, high_watermark: 0.5, ..Default::default() };
        assert!(inverted.validate(HOST).is_err());

        let out_of_range = ControllerConfig { high_watermark: 1.2, ..Default::default() };
        assert!(out_of_range.validate(HOST).is_err());
    }

    #[test]
    fn test_unaligned_chunk_rejected() {
        let config = ControllerConfig { chunk_size_mb: 1023, ..Default::default() };
        assert!(config.validate(HOST).is_err());
    }

    #[test]
    fn test_oversized_values_rejected() {
        let huge = u64::MAX / 2;
        for config in [
            ControllerConfig { max_memory_mb: Some(huge), ..Default::default() },
            ControllerConfig { reserved_host_mb: huge, ..Default::default() },
            ControllerConfig { initial_memory_mb: huge, ..Default::default() },
            ControllerConfig { min_memory_mb: huge, ..Default::default() },
        ] {
            let err = config.validate(HOST).unwrap_err();
            assert!(matches!(err, VmemError::InvalidConfig { ref reason } if reason.contains("too large")));
        }

        let slow = ControllerConfig {
            poll_interval_secs: u64::MAX,
            stale_after_polls: 3,
            ..Default::default()
        };
        assert!(matches!(slow.validate(HOST), Err(VmemError::InvalidConfig { .. })));
        assert_eq!(slow.stale_after(), Duration::MAX);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmem.json");
        std::fs::write(&path, r#"{"initial_memory_mb": 4096, "max_memory_mb": 8192}"#).unwrap();

        let config = ControllerConfig::load_from(&path).unwrap();
        assert_eq!(config.initial_memory_mb, 4096);
        assert_eq!(config.validate(HOST).unwrap().max_bytes, 8 * GIB);

        assert!(ControllerConfig::load_from(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_path_overrides() {
        let paths = VmPaths::new("/tmp/vmem-test", "lab");
        let mut config = ControllerConfig::default();
        assert_eq!(config.monitor_socket(&paths), paths.monitor_socket());

        config.monitor_socket = Some(PathBuf::from("/run/qmp.sock"));
        assert_eq!(config.monitor_socket(&paths), PathBuf::from("/run/qmp.sock"));
    }
}
