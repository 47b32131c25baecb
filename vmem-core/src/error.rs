//! Error types for the memory controller.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, VmemError>;

/// Main error type for the memory controller.
#[derive(Error, Debug)]
pub enum VmemError {
    // Monitor protocol errors
    #[error("Failed to connect to monitor socket {socket:?}: {reason}")]
    ConnectionFailed { socket: PathBuf, reason: String },

    #[error("QMP handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("QMP command '{command}' timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("QMP protocol error: {reason}")]
    ProtocolError { reason: String },

    #[error("QMP command '{command}' rejected ({class}): {desc}")]
    CommandFailed { command: String, class: String, desc: String },

    #[error("No monitor session (disconnected)")]
    NotConnected,

    // Hotplug policy errors
    #[error("No free memory slot (all {max_slots} slots in use)")]
    NoFreeSlot { max_slots: usize },

    #[error("Memory limit exceeded: {reason}")]
    LimitExceeded { reason: String },

    #[error("Slot {slot} already has a hotplug operation in flight")]
    HotplugInFlight { slot: usize },

    #[error("Invalid transition for slot {slot}: {from} -> {to}")]
    InvalidSlotTransition { slot: usize, from: String, to: String },

    // Lifecycle errors
    #[error("Memory controller for VM '{vm}' already running (PID {pid})")]
    AlreadyRunning { vm: String, pid: u32 },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VmemError {
    /// Policy refusals: logged, and the cycle degrades to a hold.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(
            self,
            Self::NoFreeSlot { .. } | Self::LimitExceeded { .. } | Self::HotplugInFlight { .. }
        )
    }

    /// Errors that must terminate the controller process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed { .. } | Self::AlreadyRunning { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Whether the session must be dropped after this error.
    ///
    /// A timed out or garbled exchange leaves the stream in an unknown position.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::CommandTimeout { .. }
                | Self::ProtocolError { .. }
                | Self::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = VmemError::CommandTimeout { command: "device_add".into(), timeout_ms: 5000 };
        assert!(timeout.poisons_session());
        assert!(!timeout.is_fatal());

        let rejected = VmemError::CommandFailed {
            command: "object-add".into(),
            class: "GenericError".into(),
            desc: "attempt to add duplicate property".into(),
        };
        assert!(!rejected.poisons_session());

        assert!(VmemError::NoFreeSlot { max_slots: 16 }.is_policy_refusal());
        assert!(VmemError::HandshakeFailed { reason: "no greeting".into() }.is_fatal());
        assert!(VmemError::AlreadyRunning { vm: "student-vm".into(), pid: 42 }.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = VmemError::CommandFailed {
            command: "device_add".into(),
            class: "GenericError".into(),
            desc: "no free slots".into(),
        };
        assert_eq!(err.to_string(), "QMP command 'device_add' rejected (GenericError): no free slots");
    }
}
