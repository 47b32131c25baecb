//! Guest memory telemetry.
//!
//! The guest writes a small JSON record into the shared directory on every
//! sample. The writer is expected to write a temporary file and rename it
//! over the record, so a reader never observes a partial write from a
//! well-behaved producer. Anything that does not look like a complete, fresh
//! sample is reported as [`Unavailable`] rather than guessed at.

use crate::config::MemorySource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

/// One guest memory sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    /// Unix seconds, integer or fractional.
    pub timestamp: f64,
    /// Monotonic sample counter. Resets when the guest reboots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
}

impl MemoryStatus {
    /// Fraction of guest memory counted as free under `source`.
    pub fn free_ratio(&self, source: MemorySource) -> f64 {
        let free = match source {
            MemorySource::Free => self.free_kb,
            MemorySource::Available => self.available_kb,
        };
        free as f64 / self.total_kb as f64
    }

    fn check_consistent(&self) -> Result<(), Unavailable> {
        if self.total_kb == 0 {
            return Err(Unavailable::Inconsistent("total_kb is 0".into()));
        }
        if self.free_kb > self.total_kb {
            return Err(Unavailable::Inconsistent(format!(
                "free_kb {} exceeds total_kb {}",
                self.free_kb, self.total_kb
            )));
        }
        if self.available_kb > self.total_kb {
            return Err(Unavailable::Inconsistent(format!(
                "available_kb {} exceeds total_kb {}",
                self.available_kb, self.total_kb
            )));
        }
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(Unavailable::Inconsistent(format!("bad timestamp {}", self.timestamp)));
        }
        Ok(())
    }
}

/// Why no usable sample could be read this poll.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Unavailable {
    #[error("status file not present")]
    Missing,

    #[error("status file unreadable: {0}")]
    Unreadable(String),

    #[error("status record malformed: {0}")]
    Malformed(String),

    #[error("status record inconsistent: {0}")]
    Inconsistent(String),

    #[error("status record is {age_secs:.1}s old")]
    Stale { age_secs: f64 },
}

/// Polls the guest-written status record.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    path: PathBuf,
    max_age: Duration,
}

impl TelemetryReader {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self { path: path.into(), max_age }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a snapshot of the current record.
    pub async fn read(&self) -> Result<MemoryStatus, Unavailable> {
        self.read_at(SystemTime::now()).await
    }

    /// Take a snapshot, judging freshness against `now`.
    pub async fn read_at(&self, now: SystemTime) -> Result<MemoryStatus, Unavailable> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Unavailable::Missing),
            Err(e) => return Err(Unavailable::Unreadable(e.to_string())),
        };

        let status = parse_status(&content)?;
        self.check_fresh(&status, now)?;

        trace!(
            total_kb = status.total_kb,
            free_kb = status.free_kb,
            seq_id = ?status.seq_id,
            "Read guest memory status"
        );
        Ok(status)
    }

    fn check_fresh(&self, status: &MemoryStatus, now: SystemTime) -> Result<(), Unavailable> {
        let now_secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let age = now_secs - status.timestamp;
        let window = self.max_age.as_secs_f64();

        // Small negative ages are clock skew between guest and host.
        if age > window || -age > window {
            return Err(Unavailable::Stale { age_secs: age });
        }
        Ok(())
    }
}

/// Parse and sanity-check a status record.
pub fn parse_status(content: &str) -> Result<MemoryStatus, Unavailable> {
    let status: MemoryStatus =
        serde_json::from_str(content).map_err(|e| Unavailable::Malformed(e.to_string()))?;
    status.check_consistent()?;
    Ok(status)
}
