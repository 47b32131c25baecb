//! Controller state persistence with SQLite.
//!
//! Each VM has one `controller_state` row (memory budget) and one `slots`
//! row per ledger slot. A save replaces both in a single transaction, so a
//! crash mid-write leaves the previous state intact.

use crate::error::{Result, VmemError};
use crate::ledger::{ControllerState, MemoryBudget, Slot, SlotLedger, SlotState};
use crate::observability::metrics as vmem_metrics;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

/// Persistent store for [`ControllerState`].
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// In-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| VmemError::DatabaseError(e.to_string()))?;
        Self::connect(options).await
    }

    /// Open (creating if needed) the database at `db_path`.
    #[instrument(skip(db_path), fields(db = %db_path.as_ref().display()))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Opening controller state at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VmemError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let options = SqliteConnectOptions::new().filename(db_path).create_if_missing(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // A single connection serialises writers and keeps an in-memory
        // database alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| VmemError::DatabaseError(e.to_string()))?;

        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// Load the state of `vm_name`, if any was saved.
    #[instrument(skip(self))]
    pub async fn load(&self, vm_name: &str) -> Result<Option<ControllerState>> {
        let row = sqlx::query(
            r#"
            SELECT initial_bytes, min_bytes, max_bytes, current_target_bytes, max_slots
            FROM controller_state WHERE vm_name = ?
            "#,
        )
        .bind(vm_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let budget = MemoryBudget {
            initial_bytes: get_u64(&row, "initial_bytes")?,
            min_bytes: get_u64(&row, "min_bytes")?,
            max_bytes: get_u64(&row, "max_bytes")?,
            current_target_bytes: get_u64(&row, "current_target_bytes")?,
        };
        let max_slots = get_u64(&row, "max_slots")? as usize;

        let rows = sqlx::query(
            "SELECT slot_id, size_bytes, state FROM slots WHERE vm_name = ? ORDER BY slot_id",
        )
        .bind(vm_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load", e))?;

        let mut slots = Vec::with_capacity(rows.len());
        for row in &rows {
            let state: String = row.try_get("state").map_err(|e| db_error("load", e))?;
            slots.push(Slot {
                id: get_u64(row, "slot_id")? as usize,
                size_bytes: get_u64(row, "size_bytes")?,
                state: SlotState::from_str(&state)?,
            });
        }

        let ledger = SlotLedger::from_slots(max_slots, slots)?;
        debug!(slots = ledger.capacity(), "Loaded controller state");
        Ok(Some(ControllerState { vm_name: vm_name.to_string(), budget, ledger }))
    }

    /// Replace the persisted state of `state.vm_name` atomically.
    #[instrument(skip(self, state), fields(vm = %state.vm_name))]
    pub async fn save(&self, state: &ControllerState) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("save", e))?;

        sqlx::query(
            r#"
            INSERT INTO controller_state
                (vm_name, initial_bytes, min_bytes, max_bytes, current_target_bytes, max_slots, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(vm_name) DO UPDATE SET
                initial_bytes = excluded.initial_bytes,
                min_bytes = excluded.min_bytes,
                max_bytes = excluded.max_bytes,
                current_target_bytes = excluded.current_target_bytes,
                max_slots = excluded.max_slots,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.vm_name)
        .bind(state.budget.initial_bytes as i64)
        .bind(state.budget.min_bytes as i64)
        .bind(state.budget.max_bytes as i64)
        .bind(state.budget.current_target_bytes as i64)
        .bind(state.ledger.capacity() as i64)
        .bind(unix_now())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("save", e))?;

        sqlx::query("DELETE FROM slots WHERE vm_name = ?")
            .bind(&state.vm_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("save", e))?;

        for slot in state.ledger.slots() {
            sqlx::query(
                r#"
                INSERT INTO slots (vm_name, slot_id, size_bytes, backend_name, device_name, state)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&state.vm_name)
            .bind(slot.id as i64)
            .bind(slot.size_bytes as i64)
            .bind(slot.backend_name())
            .bind(slot.device_name())
            .bind(slot.state.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("save", e))?;
        }

        tx.commit().await.map_err(|e| db_error("save", e))?;
        Ok(())
    }

    /// Delete everything stored for `vm_name`. Returns whether anything existed.
    #[instrument(skip(self))]
    pub async fn discard(&self, vm_name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("discard", e))?;

        sqlx::query("DELETE FROM slots WHERE vm_name = ?")
            .bind(vm_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("discard", e))?;

        let removed = sqlx::query("DELETE FROM controller_state WHERE vm_name = ?")
            .bind(vm_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("discard", e))?
            .rows_affected();

        tx.commit().await.map_err(|e| db_error("discard", e))?;
        info!(vm = vm_name, "Discarded controller state");
        Ok(removed > 0)
    }
}

fn db_error(operation: &str, e: sqlx::Error) -> VmemError {
    vmem_metrics::record_db_error(operation);
    VmemError::DatabaseError(format!("{} failed: {}", operation, e))
}

fn get_u64(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<u64> {
    let value: i64 = row.try_get(column).map_err(|e| db_error("decode", e))?;
    u64::try_from(value)
        .map_err(|_| VmemError::DatabaseError(format!("negative value in column {}", column)))
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
