//! Slot ledger and memory budget.
//!
//! The ledger is the controller's record of which hot-pluggable DIMM slots
//! are occupied. Every transition is checked here; the executor and the
//! reconciler only ever mutate slots through these methods.
//!
//! ```text
//!            begin_attach            confirm_attach
//!   Empty ─────────────────► Pending ───────────────► Attached
//!     ▲                         │                        │
//!     │        abort_attach     │                        │ begin_detach
//!     ├─────────────────────────┘                        ▼
//!     │                 confirm_detach               Detaching
//!     └──────────────────────────────────────────────────┘
//! ```
//!
//! At most one slot is `Pending` or `Detaching` at any time.

use crate::error::{Result, VmemError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Occupancy of a single DIMM slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Empty,
    /// Commands issued, confirmation outstanding.
    Pending,
    Attached,
    /// Removal requested, waiting for the guest to release the DIMM.
    Detaching,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Pending => "pending",
            SlotState::Attached => "attached",
            SlotState::Detaching => "detaching",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, SlotState::Pending | SlotState::Detaching)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotState {
    type Err = VmemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "empty" => Ok(SlotState::Empty),
            "pending" => Ok(SlotState::Pending),
            "attached" => Ok(SlotState::Attached),
            "detaching" => Ok(SlotState::Detaching),
            other => Err(VmemError::DatabaseError(format!("unknown slot state '{}'", other))),
        }
    }
}

/// One hot-pluggable memory slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: usize,
    /// Zero while the slot is empty.
    pub size_bytes: u64,
    pub state: SlotState,
}

impl Slot {
    fn empty(id: usize) -> Self {
        Self { id, size_bytes: 0, state: SlotState::Empty }
    }

    /// Id of the `memory-backend-ram` object.
    pub fn backend_name(&self) -> String {
        backend_name(self.id)
    }

    /// Id of the `pc-dimm` device.
    pub fn device_name(&self) -> String {
        device_name(self.id)
    }
}

pub fn backend_name(slot: usize) -> String {
    format!("mem-slot{}", slot)
}

pub fn device_name(slot: usize) -> String {
    format!("dimm-slot{}", slot)
}

/// Recover a slot id from a device id we created (`dimm-slotN`).
pub fn slot_from_device(device: &str) -> Option<usize> {
    device.strip_prefix("dimm-slot")?.parse().ok()
}

/// Memory bounds and the current balloon target, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub initial_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub current_target_bytes: u64,
}

impl MemoryBudget {
    pub fn new(initial_bytes: u64, min_bytes: u64, max_bytes: u64) -> Self {
        Self { initial_bytes, min_bytes, max_bytes, current_target_bytes: initial_bytes }
    }

    /// Move the target, refusing anything outside `[min, max]`.
    pub fn set_target(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.max_bytes {
            return Err(VmemError::LimitExceeded {
                reason: format!("target {} above maximum {}", bytes, self.max_bytes),
            });
        }
        if bytes < self.min_bytes {
            return Err(VmemError::LimitExceeded {
                reason: format!("target {} below minimum {}", bytes, self.min_bytes),
            });
        }
        self.current_target_bytes = bytes;
        Ok(())
    }

    /// Adopt the bounds of a new configuration, keeping the target inside them.
    pub fn rebound(&mut self, bounds: &MemoryBudget) {
        self.initial_bytes = bounds.initial_bytes;
        self.min_bytes = bounds.min_bytes;
        self.max_bytes = bounds.max_bytes;
        self.current_target_bytes =
            self.current_target_bytes.clamp(self.min_bytes, self.max_bytes);
    }
}

/// Fixed-size array of slots indexed by slot id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLedger {
    slots: Vec<Slot>,
}

impl SlotLedger {
    pub fn new(max_slots: usize) -> Self {
        Self { slots: (0..max_slots).map(Slot::empty).collect() }
    }

    /// Rebuild from persisted rows. Ids must be unique and below `max_slots`.
    pub fn from_slots(max_slots: usize, rows: Vec<Slot>) -> Result<Self> {
        let mut ledger = Self::new(max_slots);
        for slot in rows {
            if slot.id >= max_slots {
                return Err(VmemError::InvalidConfig {
                    reason: format!(
                        "persisted slot {} does not fit max_slots = {}",
                        slot.id, max_slots
                    ),
                });
            }
            let id = slot.id;
            ledger.slots[id] = slot;
        }
        if ledger.slots.iter().filter(|s| s.state.is_in_flight()).count() > 1 {
            return Err(VmemError::Internal("persisted ledger has several slots in flight".into()));
        }
        Ok(ledger)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, id: usize) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// The slot with an operation outstanding, if any.
    pub fn in_flight(&self) -> Option<&Slot> {
        self.slots.iter().find(|s| s.state.is_in_flight())
    }

    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|s| s.state == SlotState::Pending)
    }

    pub fn has_detaching(&self) -> bool {
        self.slots.iter().any(|s| s.state == SlotState::Detaching)
    }

    pub fn lowest_empty(&self) -> Option<usize> {
        self.slots.iter().find(|s| s.state == SlotState::Empty).map(|s| s.id)
    }

    pub fn highest_attached(&self) -> Option<usize> {
        self.slots.iter().rev().find(|s| s.state == SlotState::Attached).map(|s| s.id)
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    /// Bytes of DIMMs currently plugged into the guest.
    ///
    /// A detaching DIMM is still plugged until the hypervisor reports it gone.
    pub fn plugged_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Attached | SlotState::Detaching))
            .map(|s| s.size_bytes)
            .sum()
    }

    /// Bytes of DIMMs attached and not on their way out.
    pub fn attached_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Attached)
            .map(|s| s.size_bytes)
            .sum()
    }

    pub fn begin_attach(&mut self, id: usize, size_bytes: u64) -> Result<()> {
        if let Some(busy) = self.in_flight() {
            return Err(VmemError::HotplugInFlight { slot: busy.id });
        }
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Empty, SlotState::Pending)?;
        slot.state = SlotState::Pending;
        slot.size_bytes = size_bytes;
        Ok(())
    }

    /// Pending → Attached. Returns `false` if the slot was already attached.
    pub fn confirm_attach(&mut self, id: usize) -> Result<bool> {
        let slot = self.slot_mut(id)?;
        match slot.state {
            SlotState::Attached => Ok(false),
            SlotState::Pending => {
                slot.state = SlotState::Attached;
                Ok(true)
            }
            _ => Err(invalid(slot, SlotState::Attached)),
        }
    }

    /// Pending → Empty after the hypervisor refused or never saw the DIMM.
    pub fn abort_attach(&mut self, id: usize) -> Result<()> {
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Pending, SlotState::Empty)?;
        *slot = Slot::empty(id);
        Ok(())
    }

    pub fn begin_detach(&mut self, id: usize) -> Result<()> {
        if let Some(busy) = self.in_flight() {
            return Err(VmemError::HotplugInFlight { slot: busy.id });
        }
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Attached, SlotState::Detaching)?;
        slot.state = SlotState::Detaching;
        Ok(())
    }

    /// Detaching → Attached after the hypervisor refused the removal.
    pub fn cancel_detach(&mut self, id: usize) -> Result<()> {
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Detaching, SlotState::Attached)?;
        slot.state = SlotState::Attached;
        Ok(())
    }

    /// Detaching → Empty. Returns `false` if the slot was already empty.
    pub fn confirm_detach(&mut self, id: usize) -> Result<bool> {
        let slot = self.slot_mut(id)?;
        match slot.state {
            SlotState::Empty => Ok(false),
            SlotState::Detaching => {
                *slot = Slot::empty(id);
                Ok(true)
            }
            _ => Err(invalid(slot, SlotState::Empty)),
        }
    }

    /// Attached → Empty for a DIMM that vanished without us asking.
    pub fn forget(&mut self, id: usize) -> Result<()> {
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Attached, SlotState::Empty)?;
        *slot = Slot::empty(id);
        Ok(())
    }

    /// Empty → Attached for a DIMM found plugged that the ledger never recorded.
    pub fn adopt(&mut self, id: usize, size_bytes: u64) -> Result<()> {
        let slot = self.slot_mut(id)?;
        expect_state(slot, SlotState::Empty, SlotState::Attached)?;
        slot.state = SlotState::Attached;
        slot.size_bytes = size_bytes;
        Ok(())
    }

    fn slot_mut(&mut self, id: usize) -> Result<&mut Slot> {
        let capacity = self.slots.len();
        self.slots.get_mut(id).ok_or_else(|| VmemError::InvalidSlotTransition {
            slot: id,
            from: "out of range".into(),
            to: format!("(capacity {})", capacity),
        })
    }
}

fn expect_state(slot: &Slot, expected: SlotState, to: SlotState) -> Result<()> {
    if slot.state == expected {
        Ok(())
    } else {
        Err(invalid(slot, to))
    }
}

fn invalid(slot: &Slot, to: SlotState) -> VmemError {
    VmemError::InvalidSlotTransition {
        slot: slot.id,
        from: slot.state.to_string(),
        to: to.to_string(),
    }
}

/// Everything persisted for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub vm_name: String,
    pub budget: MemoryBudget,
    pub ledger: SlotLedger,
}

impl ControllerState {
    /// Fresh state: every slot empty, target at the initial size.
    pub fn new(vm_name: impl Into<String>, budget: MemoryBudget, max_slots: usize) -> Self {
        let mut budget = budget;
        budget.current_target_bytes = budget.initial_bytes;
        Self { vm_name: vm_name.into(), budget, ledger: SlotLedger::new(max_slots) }
    }

    /// Memory physically present in the guest: boot RAM plus plugged DIMMs.
    pub fn physical_bytes(&self) -> u64 {
        self.budget.initial_bytes + self.ledger.plugged_bytes()
    }

    /// Memory the guest keeps once in-flight removals finish.
    pub fn retained_bytes(&self) -> u64 {
        self.budget.initial_bytes + self.ledger.attached_bytes()
    }

    /// Confirm a pending attach and raise the target by the DIMM size.
    ///
    /// Repeated confirmations leave the target untouched.
    pub fn confirm_attach(&mut self, slot: usize) -> Result<bool> {
        if !self.ledger.confirm_attach(slot)? {
            return Ok(false);
        }
        let size = self.ledger.get(slot).map(|s| s.size_bytes).unwrap_or(0);
        let target = (self.budget.current_target_bytes + size).min(self.budget.max_bytes);
        self.budget.current_target_bytes = target;
        Ok(true)
    }

    /// Confirm a detach and pull the target down to what is still plugged.
    pub fn confirm_detach(&mut self, slot: usize) -> Result<bool> {
        if !self.ledger.confirm_detach(slot)? {
            return Ok(false);
        }
        self.clamp_target_to_physical();
        Ok(true)
    }

    /// Drop an attached DIMM the hypervisor no longer reports.
    pub fn forget(&mut self, slot: usize) -> Result<()> {
        self.ledger.forget(slot)?;
        self.clamp_target_to_physical();
        Ok(())
    }

    fn clamp_target_to_physical(&mut self) {
        let physical = self.physical_bytes();
        if self.budget.current_target_bytes > physical {
            self.budget.current_target_bytes = physical.max(self.budget.min_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn state() -> ControllerState {
        ControllerState::new("student-vm", MemoryBudget::new(2 * GIB, GIB, 8 * GIB), 4)
    }

    #[test]
    fn test_names_round_trip() {
        assert_eq!(backend_name(3), "mem-slot3");
        assert_eq!(device_name(3), "dimm-slot3");
        assert_eq!(slot_from_device("dimm-slot12"), Some(12));
        assert_eq!(slot_from_device("virtio-balloon0"), None);
        assert_eq!(slot_from_device("dimm-slotx"), None);
    }

    #[test]
    fn test_attach_lifecycle() {
        let mut state = state();
        state.ledger.begin_attach(0, GIB).unwrap();
        assert!(state.ledger.has_pending());
        assert_eq!(state.physical_bytes(), 2 * GIB);

        assert!(state.confirm_attach(0).unwrap());
        assert_eq!(state.budget.current_target_bytes, 3 * GIB);
        assert_eq!(state.physical_bytes(), 3 * GIB);
        assert_eq!(state.ledger.lowest_empty(), Some(1));
    }

    #[test]
    fn test_duplicate_confirmations_do_not_double_count() {
        let mut state = state();
        state.ledger.begin_attach(0, GIB).unwrap();
        assert!(state.confirm_attach(0).unwrap());
        assert!(!state.confirm_attach(0).unwrap());
        assert_eq!(state.budget.current_target_bytes, 3 * GIB);

        state.ledger.begin_detach(0).unwrap();
        assert!(state.confirm_detach(0).unwrap());
        assert!(!state.confirm_detach(0).unwrap());
        assert_eq!(state.budget.current_target_bytes, 2 * GIB);
        assert_eq!(state.ledger.count(SlotState::Empty), 4);
    }

    #[test]
    fn test_single_operation_in_flight() {
        let mut ledger = SlotLedger::new(4);
        ledger.begin_attach(0, GIB).unwrap();
        let err = ledger.begin_attach(1, GIB).unwrap_err();
        assert!(matches!(err, VmemError::HotplugInFlight { slot: 0 }));

        ledger.confirm_attach(0).unwrap();
        ledger.adopt(1, GIB).unwrap();
        ledger.begin_detach(1).unwrap();
        assert!(ledger.begin_detach(0).is_err());
        assert_eq!(ledger.in_flight().map(|s| s.id), Some(1));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut ledger = SlotLedger::new(2);
        assert!(matches!(
            ledger.confirm_attach(0),
            Err(VmemError::InvalidSlotTransition { slot: 0, .. })
        ));
        assert!(ledger.begin_detach(0).is_err());
        assert!(ledger.begin_attach(5, GIB).is_err());
    }

    #[test]
    fn test_abort_resets_slot() {
        let mut ledger = SlotLedger::new(2);
        ledger.begin_attach(0, GIB).unwrap();
        ledger.abort_attach(0).unwrap();
        assert_eq!(ledger.get(0), Some(&Slot { id: 0, size_bytes: 0, state: SlotState::Empty }));
    }

    #[test]
    fn test_highest_attached() {
        let mut ledger = SlotLedger::new(4);
        ledger.adopt(0, GIB).unwrap();
        ledger.adopt(2, GIB).unwrap();
        assert_eq!(ledger.highest_attached(), Some(2));
        assert_eq!(ledger.plugged_bytes(), 2 * GIB);

        ledger.begin_detach(2).unwrap();
        assert_eq!(ledger.plugged_bytes(), 2 * GIB);
        assert_eq!(ledger.attached_bytes(), GIB);
    }

    #[test]
    fn test_budget_bounds() {
        let mut budget = MemoryBudget::new(2 * GIB, GIB, 4 * GIB);
        assert!(budget.set_target(4 * GIB).is_ok());
        assert!(matches!(budget.set_target(5 * GIB), Err(VmemError::LimitExceeded { .. })));
        assert!(matches!(budget.set_target(GIB / 2), Err(VmemError::LimitExceeded { .. })));
        assert_eq!(budget.current_target_bytes, 4 * GIB);

        budget.rebound(&MemoryBudget::new(2 * GIB, GIB, 3 * GIB));
        assert_eq!(budget.current_target_bytes, 3 * GIB);
    }

    #[test]
    fn test_from_slots_places_rows_by_id() {
        let rows = vec![
            Slot { id: 2, size_bytes: GIB, state: SlotState::Attached },
            Slot { id: 0, size_bytes: GIB, state: SlotState::Pending },
        ];
        let ledger = SlotLedger::from_slots(4, rows).unwrap();
        assert_eq!(ledger.capacity(), 4);
        assert_eq!(ledger.get(0).unwrap().state, SlotState::Pending);
        assert_eq!(ledger.get(1).unwrap().state, SlotState::Empty);
        assert_eq!(ledger.get(2).unwrap().size_bytes, GIB);
        assert_eq!(ledger.highest_attached(), Some(2));
    }

    #[test]
    fn test_from_slots_rejects_out_of_range() {
        let rows = vec![Slot { id: 7, size_bytes: GIB, state: SlotState::Attached }];
        assert!(SlotLedger::from_slots(4, rows).is_err());
    }
}
