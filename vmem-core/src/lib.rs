//! vmem Core Library
//!
//! Dynamic memory controller for QEMU guests: reads guest memory pressure,
//! decides whether to grow, shrink or hold, and drives DIMM hotplug and the
//! balloon over QMP while keeping a durable ledger of occupied slots.

pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod host;
pub mod hotplug;
pub mod ledger;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod qmp;
pub mod state;
pub mod telemetry;

// Re-export commonly used items
pub use config::{ControllerConfig, MemorySource, ShrinkFloor};
pub use controller::{Controller, ControllerPhase, ControllerSetup, CycleReport};
pub use decision::{Decision, DecisionEngine, DecisionPolicy};
pub use error::{Result, VmemError};
pub use hotplug::{HotplugExecutor, HotplugOutcome, ReconcileReport};
pub use ledger::{ControllerState, MemoryBudget, Slot, SlotLedger, SlotState};
pub use lock::{InstanceLock, LockOwner};
pub use observability::{health::HealthChecker, init as init_observability};
pub use paths::VmPaths;
pub use qmp::{MonitorConnector, MonitorSession, QmpClient, QmpCommand, QmpConnector};
pub use state::StateStore;
pub use telemetry::{MemoryStatus, TelemetryReader, Unavailable};
