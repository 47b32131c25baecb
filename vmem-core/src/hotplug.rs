//! Hotplug executor.
//!
//! Turns a [`Decision`] into monitor commands and keeps the ledger in step
//! with what the hypervisor confirmed. The ledger is persisted before any
//! command that starts a slot operation, so a crash or timeout mid-operation
//! leaves the slot `Pending` / `Detaching` for [`HotplugExecutor::reconcile`]
//! to resolve.

use crate::config::MIB;
use crate::decision::Decision;
use crate::error::{Result, VmemError};
use crate::ledger::{self, ControllerState, SlotState};
use crate::observability::metrics as vmem_metrics;
use crate::qmp::{MonitorSession, QmpCommand, QmpEvent};
use crate::state::StateStore;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// DIMM sizes are rounded down to this.
pub const DIMM_ALIGNMENT: u64 = 2 * 1024 * 1024;

/// What an applied decision changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugOutcome {
    /// Nothing to do.
    Unchanged,
    /// Balloon target moved; no slot touched.
    BalloonAdjusted { from: u64, to: u64 },
    /// A DIMM was plugged into `slot`.
    Attached { slot: usize, size_bytes: u64 },
    /// Removal of `slot` requested; completion arrives later.
    DetachRequested { slot: usize },
}

impl HotplugOutcome {
    /// Whether the VM's memory configuration changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, HotplugOutcome::Unchanged)
    }
}

/// Differences found by [`HotplugExecutor::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending slots whose DIMM turned out to be plugged.
    pub confirmed: Vec<usize>,
    /// Pending slots whose DIMM never appeared.
    pub reverted: Vec<usize>,
    /// Detaching slots whose DIMM is gone.
    pub removed: Vec<usize>,
    /// Attached slots whose DIMM vanished without a request.
    pub lost: Vec<usize>,
    /// DIMMs plugged in the hypervisor that the ledger did not know about.
    pub adopted: Vec<usize>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !(self.confirmed.is_empty()
            && self.reverted.is_empty()
            && self.removed.is_empty()
            && self.lost.is_empty()
            && self.adopted.is_empty())
    }
}

/// Applies decisions through a monitor session.
#[derive(Debug, Clone)]
pub struct HotplugExecutor {
    command_timeout: Duration,
}

impl HotplugExecutor {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Apply one decision.
    ///
    /// Policy refusals (`NoFreeSlot`, `LimitExceeded`, `HotplugInFlight`)
    /// are returned before any command is issued and leave the ledger as is.
    #[instrument(skip_all, fields(vm = %state.vm_name, %decision))]
    pub async fn apply(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        decision: Decision,
    ) -> Result<HotplugOutcome> {
        match decision {
            Decision::Hold | Decision::Grow(0) | Decision::Shrink(0) => Ok(HotplugOutcome::Unchanged),
            Decision::Grow(amount) => self.grow(session, store, state, amount).await,
            Decision::Shrink(amount) => self.shrink(session, store, state, amount).await,
        }
    }

    async fn grow(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        amount: u64,
    ) -> Result<HotplugOutcome> {
        let current = state.budget.current_target_bytes;
        let wanted = current.saturating_add(amount);
        if wanted > state.budget.max_bytes {
            return Err(VmemError::LimitExceeded {
                reason: format!(
                    "growing to {} MiB would exceed maximum {} MiB",
                    wanted / MIB,
                    state.budget.max_bytes / MIB
                ),
            });
        }

        // Memory held back by the balloon goes back to the guest first.
        // A detaching DIMM is not headroom.
        let retained = state.retained_bytes();
        if retained > current {
            let to = current + amount.min(retained - current);
            return self.set_balloon(session, store, state, to).await;
        }

        if let Some(busy) = state.ledger.in_flight() {
            return Err(VmemError::HotplugInFlight { slot: busy.id });
        }
        let Some(slot) = state.ledger.lowest_empty() else {
            warn!(max_slots = state.ledger.capacity(), "No free memory slot, holding");
            vmem_metrics::record_hotplug("attach", "no_free_slot");
            return Err(VmemError::NoFreeSlot { max_slots: state.ledger.capacity() });
        };
        let size = amount - amount % DIMM_ALIGNMENT;
        if size == 0 {
            return Err(VmemError::LimitExceeded {
                reason: format!("{} bytes of headroom is below the DIMM alignment", amount),
            });
        }

        state.ledger.begin_attach(slot, size)?;
        store.save(state).await?;
        info!(slot, size_mib = size / MIB, "Hotplugging DIMM");

        let backend = ledger::backend_name(slot);
        let device = ledger::device_name(slot);

        let object_add = QmpCommand::ObjectAdd { id: backend.clone(), size };
        if let Err(e) = session.execute(&object_add, self.command_timeout).await {
            return self.fail_attach(session, store, state, slot, e, false).await;
        }

        let device_add = QmpCommand::DeviceAdd { id: device, memdev: backend };
        if let Err(e) = session.execute(&device_add, self.command_timeout).await {
            return self.fail_attach(session, store, state, slot, e, true).await;
        }

        state.confirm_attach(slot)?;
        store.save(state).await?;
        vmem_metrics::record_hotplug("attach", "ok");
        info!(
            slot,
            target_mib = state.budget.current_target_bytes / MIB,
            "DIMM attached"
        );

        self.sync_balloon(session, state).await?;
        Ok(HotplugOutcome::Attached { slot, size_bytes: size })
    }

    /// Handle a failed attach command.
    ///
    /// An explicit rejection reverts the slot. Anything else leaves it
    /// `Pending`: the hypervisor may or may not have applied the command.
    async fn fail_attach(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        slot: usize,
        error: VmemError,
        backend_created: bool,
    ) -> Result<HotplugOutcome> {
        if !matches!(error, VmemError::CommandFailed { .. }) {
            warn!(slot, "Attach outcome unknown, slot left pending: {}", error);
            vmem_metrics::record_hotplug("attach", "unknown");
            return Err(error);
        }

        state.ledger.abort_attach(slot)?;
        store.save(state).await?;
        vmem_metrics::record_hotplug("attach", "rejected");
        warn!(slot, "Attach rejected, slot reverted: {}", error);

        if backend_created {
            self.remove_backend(session, slot).await?;
        }
        Err(error)
    }

    async fn shrink(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        amount: u64,
    ) -> Result<HotplugOutcome> {
        let current = state.budget.current_target_bytes;
        let to = current.saturating_sub(amount);
        if amount > current || to < state.budget.min_bytes {
            return Err(VmemError::LimitExceeded {
                reason: format!(
                    "shrinking by {} MiB would go below minimum {} MiB",
                    amount / MIB,
                    state.budget.min_bytes / MIB
                ),
            });
        }

        let reclaim = if to < state.budget.initial_bytes { state.ledger.highest_attached() } else { None };
        let Some(slot) = reclaim else {
            return self.set_balloon(session, store, state, to).await;
        };

        if let Some(busy) = state.ledger.in_flight() {
            return Err(VmemError::HotplugInFlight { slot: busy.id });
        }

        state.ledger.begin_detach(slot)?;
        store.save(state).await?;
        info!(slot, "Requesting DIMM removal");

        let device_del = QmpCommand::DeviceDel { id: ledger::device_name(slot) };
        match session.execute(&device_del, self.command_timeout).await {
            Ok(_) => {
                vmem_metrics::record_hotplug("detach", "requested");
                Ok(HotplugOutcome::DetachRequested { slot })
            }
            Err(e @ VmemError::CommandFailed { .. }) => {
                state.ledger.cancel_detach(slot)?;
                store.save(state).await?;
                vmem_metrics::record_hotplug("detach", "rejected");
                warn!(slot, "Removal rejected, slot stays attached: {}", e);
                Err(e)
            }
            Err(e) => {
                vmem_metrics::record_hotplug("detach", "unknown");
                warn!(slot, "Removal outcome unknown, slot left detaching: {}", e);
                Err(e)
            }
        }
    }

    async fn set_balloon(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        to: u64,
    ) -> Result<HotplugOutcome> {
        let from = state.budget.current_target_bytes;
        // Validate before issuing the command.
        let mut budget = state.budget;
        budget.set_target(to)?;

        match session.execute(&QmpCommand::Balloon { value: to }, self.command_timeout).await {
            Ok(_) => vmem_metrics::record_hotplug("balloon", "ok"),
            Err(e) => {
                vmem_metrics::record_hotplug("balloon", "failed");
                return Err(e);
            }
        }

        state.budget = budget;
        store.save(state).await?;
        info!(from_mib = from / MIB, to_mib = to / MIB, "Balloon target adjusted");
        Ok(HotplugOutcome::BalloonAdjusted { from, to })
    }

    /// Point the balloon at the current target after plugged memory changed.
    ///
    /// A hypervisor without a balloon device rejects this; that is not an error.
    async fn sync_balloon(
        &self,
        session: &mut dyn MonitorSession,
        state: &ControllerState,
    ) -> Result<()> {
        let value = state.budget.current_target_bytes;
        match session.execute(&QmpCommand::Balloon { value }, self.command_timeout).await {
            Ok(_) => Ok(()),
            Err(e @ VmemError::CommandFailed { .. }) => {
                debug!("Balloon not adjusted: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the backend object of `slot`, tolerating rejection.
    async fn remove_backend(&self, session: &mut dyn MonitorSession, slot: usize) -> Result<()> {
        let object_del = QmpCommand::ObjectDel { id: ledger::backend_name(slot) };
        match session.execute(&object_del, self.command_timeout).await {
            Ok(_) => Ok(()),
            Err(e @ VmemError::CommandFailed { .. }) => {
                debug!(slot, "Backend not removed: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply asynchronous events. Returns how many changed the ledger.
    #[instrument(skip_all, fields(vm = %state.vm_name, count = events.len()))]
    pub async fn handle_events(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
        events: Vec<QmpEvent>,
    ) -> Result<usize> {
        let mut applied = 0;
        for event in events {
            let Some(device) = event.deleted_device() else {
                debug!(event = %event.event, data = %event.data, "Monitor event");
                continue;
            };
            let Some(slot) = ledger::slot_from_device(device) else {
                debug!(device, "Ignoring removal of a device we do not manage");
                continue;
            };

            match state.ledger.get(slot).map(|s| s.state) {
                Some(SlotState::Detaching) => {
                    state.confirm_detach(slot)?;
                    store.save(state).await?;
                    vmem_metrics::record_hotplug("detach", "ok");
                    info!(slot, "DIMM removed");
                    applied += 1;
                    self.remove_backend(session, slot).await?;
                }
                Some(SlotState::Attached) => {
                    warn!(slot, "DIMM removed without a request");
                    state.forget(slot)?;
                    store.save(state).await?;
                    applied += 1;
                    self.remove_backend(session, slot).await?;
                }
                Some(SlotState::Empty) => debug!(slot, "Duplicate removal event"),
                Some(SlotState::Pending) => {
                    warn!(slot, "Removal event for a pending slot, leaving it to reconciliation")
                }
                None => debug!(slot, "Removal event for a slot beyond the ledger"),
            }
        }
        Ok(applied)
    }

    /// Align the ledger with `query-memory-devices`.
    ///
    /// Resolves in-flight slots, drops DIMMs that disappeared and adopts
    /// plugged DIMMs the ledger does not record. Idempotent.
    #[instrument(skip_all, fields(vm = %state.vm_name))]
    pub async fn reconcile(
        &self,
        session: &mut dyn MonitorSession,
        store: &StateStore,
        state: &mut ControllerState,
    ) -> Result<ReconcileReport> {
        let devices = session.query_memory_devices(self.command_timeout).await?;

        let mut plugged: HashMap<usize, u64> = HashMap::new();
        for device in devices.iter().filter(|d| d.kind == "dimm") {
            match device.id.as_deref().and_then(ledger::slot_from_device) {
                Some(slot) if slot < state.ledger.capacity() => {
                    plugged.insert(slot, device.size);
                }
                _ => debug!(id = ?device.id, "Ignoring unmanaged memory device"),
            }
        }

        let mut report = ReconcileReport::default();
        let snapshot: Vec<(usize, SlotState)> =
            state.ledger.slots().iter().map(|s| (s.id, s.state)).collect();

        for (slot, slot_state) in snapshot {
            let present = plugged.get(&slot).copied();
            match (slot_state, present) {
                (SlotState::Pending, Some(_)) => {
                    state.confirm_attach(slot)?;
                    report.confirmed.push(slot);
                }
                (SlotState::Pending, None) => {
                    state.ledger.abort_attach(slot)?;
                    report.reverted.push(slot);
                }
                (SlotState::Detaching, None) => {
                    state.confirm_detach(slot)?;
                    report.removed.push(slot);
                }
                (SlotState::Attached, None) => {
                    warn!(slot, "Attached DIMM missing from hypervisor");
                    state.forget(slot)?;
                    report.lost.push(slot);
                }
                (SlotState::Empty, Some(size)) => {
                    warn!(slot, size_mib = size / MIB, "Adopting DIMM missing from ledger");
                    state.ledger.adopt(slot, size)?;
                    report.adopted.push(slot);
                }
                _ => {}
            }
        }

        if !report.changed() {
            return Ok(report);
        }

        store.save(state).await?;
        info!(?report, "Ledger reconciled with hypervisor");

        for &slot in report.reverted.iter().chain(&report.removed).chain(&report.lost) {
            self.remove_backend(session, slot).await?;
        }
        if !report.confirmed.is_empty() {
            self.sync_balloon(session, state).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_change() {
        assert!(!HotplugOutcome::Unchanged.is_change());
        assert!(HotplugOutcome::DetachRequested { slot: 1 }.is_change());
        assert!(HotplugOutcome::BalloonAdjusted { from: 1, to: 2 }.is_change());
    }

    #[test]
    fn test_report_changed() {
        let mut report = ReconcileReport::default();
        assert!(!report.changed());
        report.adopted.push(3);
        assert!(report.changed());
    }
}
