use crate::ledger::{ControllerState, MemoryBudget, SlotState};
use crate::state::StateStore;

const GIB: u64 = 1024 * 1024 * 1024;

fn sample_state(name: &str) -> ControllerState {
    let mut state = ControllerState::new(name, MemoryBudget::new(2 * GIB, GIB, 14 * GIB), 16);
    state.ledger.begin_attach(0, GIB).unwrap();
    state.confirm_attach(0).unwrap();
    state.ledger.begin_attach(1, GIB).unwrap();
    state
}

#[tokio::test]
async fn test_store_init() {
    let store = StateStore::new_in_memory().await.unwrap();
    assert!(store.load("alpha").await.unwrap().is_none());
    assert!(!store.discard("alpha").await.unwrap());
}

#[tokio::test]
async fn test_load_missing_vm() {
    let store = StateStore::new_in_memory().await.unwrap();
    assert!(store.load("student-vm").await.unwrap().is_none());
}

#[tokio::test]
async fn test_persist_then_reload_is_exact() {
    let store = StateStore::new_in_memory().await.unwrap();
    let state = sample_state("student-vm");

    store.save(&state).await.unwrap();
    let loaded = store.load("student-vm").await.unwrap().unwrap();

    assert_eq!(loaded, state);
    assert_eq!(loaded.budget.current_target_bytes, 3 * GIB);
    assert_eq!(loaded.ledger.get(1).map(|s| s.state), Some(SlotState::Pending));
}

#[tokio::test]
async fn test_save_overwrites() {
    let store = StateStore::new_in_memory().await.unwrap();
    let mut state = sample_state("student-vm");
    store.save(&state).await.unwrap();

    state.confirm_attach(1).unwrap();
    state.ledger.begin_detach(0).unwrap();
    store.save(&state).await.unwrap();

    let loaded = store.load("student-vm").await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.ledger.count(SlotState::Detaching), 1);
}

#[tokio::test]
async fn test_discard_keeps_other_vms() {
    let store = StateStore::new_in_memory().await.unwrap();
    store.save(&sample_state("alpha")).await.unwrap();
    store.save(&sample_state("beta")).await.unwrap();

    assert!(store.discard("alpha").await.unwrap());
    assert!(!store.discard("alpha").await.unwrap());
    assert!(store.load("alpha").await.unwrap().is_none());
    assert!(store.load("beta").await.unwrap().is_some());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("vm").join("vmem-state.db");
    let state = sample_state("student-vm");

    {
        let store = StateStore::new(&db).await.unwrap();
        store.save(&state).await.unwrap();
    }

    let store = StateStore::new(&db).await.unwrap();
    assert_eq!(store.load("student-vm").await.unwrap(), Some(state));
}
