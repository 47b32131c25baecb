//! Grow / shrink / hold decisions.
//!
//! [`evaluate`] is a pure function of one sample, the budget and the
//! ledger. [`DecisionEngine`] wraps it with the state that spans polls:
//! how long telemetry has been missing, which sample was last acted on,
//! and the cooldown after an applied action.

use crate::config::{ControllerConfig, MemorySource, ShrinkFloor};
use crate::ledger::{ControllerState, MemoryBudget, SlotLedger};
use crate::telemetry::{MemoryStatus, Unavailable};
use std::fmt;
use tracing::debug;

/// Outcome of one evaluation. Magnitudes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Grow(u64),
    Shrink(u64),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Hold => "hold",
            Decision::Grow(_) => "grow",
            Decision::Shrink(_) => "shrink",
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Decision::Hold)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Hold => f.write_str("hold"),
            Decision::Grow(bytes) => write!(f, "grow {} MiB", bytes / (1024 * 1024)),
            Decision::Shrink(bytes) => write!(f, "shrink {} MiB", bytes / (1024 * 1024)),
        }
    }
}

/// Thresholds and step size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub low_watermark: f64,
    pub high_watermark: f64,
    pub chunk_bytes: u64,
    pub memory_source: MemorySource,
    pub shrink_floor: ShrinkFloor,
}

impl DecisionPolicy {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            low_watermark: config.low_watermark,
            high_watermark: config.high_watermark,
            chunk_bytes: config.chunk_bytes(),
            memory_source: config.memory_source,
            shrink_floor: config.shrink_floor,
        }
    }

    /// Lowest target a shrink may reach.
    pub fn floor(&self, budget: &MemoryBudget) -> u64 {
        match self.shrink_floor {
            ShrinkFloor::Initial => budget.initial_bytes,
            ShrinkFloor::Minimum => budget.min_bytes,
        }
        .max(budget.min_bytes)
    }
}

/// Decide what one sample calls for.
pub fn evaluate(
    status: &MemoryStatus,
    budget: &MemoryBudget,
    ledger: &SlotLedger,
    policy: &DecisionPolicy,
) -> Decision {
    let ratio = status.free_ratio(policy.memory_source);
    let current = budget.current_target_bytes;

    if ratio < policy.low_watermark && current < budget.max_bytes && !ledger.has_pending() {
        return Decision::Grow(policy.chunk_bytes.min(budget.max_bytes - current));
    }

    let floor = policy.floor(budget);
    if ratio > policy.high_watermark && current > floor && !ledger.has_detaching() {
        return Decision::Shrink(policy.chunk_bytes.min(current - floor));
    }

    Decision::Hold
}

/// Identity of a sample, used to avoid acting twice on the same record.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SampleKey {
    Seq(u64),
    Timestamp(u64),
}

impl SampleKey {
    fn of(status: &MemoryStatus) -> Self {
        match status.seq_id {
            Some(seq) => SampleKey::Seq(seq),
            None => SampleKey::Timestamp(status.timestamp.to_bits()),
        }
    }
}

/// Stateful wrapper around [`evaluate`].
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
    stale_after_polls: u32,
    cooldown_polls: u32,
    unavailable_streak: u32,
    cooldown_remaining: u32,
    last_sample: Option<SampleKey>,
    last_ratio: Option<f64>,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy, stale_after_polls: u32, cooldown_polls: u32) -> Self {
        Self {
            policy,
            stale_after_polls,
            cooldown_polls,
            unavailable_streak: 0,
            cooldown_remaining: 0,
            last_sample: None,
            last_ratio: None,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(DecisionPolicy::from_config(config), config.stale_after_polls, config.cooldown_polls)
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Feed one poll's reading and get this cycle's decision.
    pub fn observe(
        &mut self,
        reading: &Result<MemoryStatus, Unavailable>,
        state: &ControllerState,
    ) -> Decision {
        let cooling = self.cooldown_remaining > 0;
        if cooling {
            self.cooldown_remaining -= 1;
        }

        let status = match reading {
            Ok(status) => status,
            Err(reason) => {
                self.unavailable_streak = self.unavailable_streak.saturating_add(1);
                debug!(streak = self.unavailable_streak, %reason, "No usable telemetry");
                return Decision::Hold;
            }
        };
        self.unavailable_streak = 0;

        let key = SampleKey::of(status);
        if self.last_sample == Some(key) {
            debug!(sample = ?key, "Sample already evaluated");
            return Decision::Hold;
        }
        self.last_sample = Some(key);
        self.last_ratio = Some(status.free_ratio(self.policy.memory_source));

        if cooling {
            debug!(remaining = self.cooldown_remaining, "Cooling down after last action");
            return Decision::Hold;
        }

        evaluate(status, &state.budget, &state.ledger, &self.policy)
    }

    /// Start the cooldown after an action actually changed the VM.
    pub fn note_applied(&mut self) {
        self.cooldown_remaining = self.cooldown_polls;
    }

    /// Telemetry has been missing for more than the tolerated number of polls.
    pub fn is_stale(&self) -> bool {
        self.unavailable_streak > self.stale_after_polls
    }

    pub fn unavailable_streak(&self) -> u32 {
        self.unavailable_streak
    }

    /// Free ratio of the last fresh sample.
    pub fn last_ratio(&self) -> Option<f64> {
        self.last_ratio
    }
}
