//! Database migrations.

use crate::error::{Result, VmemError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

pub const SCHEMA_VERSION: i64 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(VmemError::MigrationFailed {
            reason: format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            ),
        });
    }
    if current_version == SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // One row per VM: memory bounds and the balloon target.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS controller_state (
            vm_name TEXT PRIMARY KEY,
            initial_bytes INTEGER NOT NULL,
            min_bytes INTEGER NOT NULL,
            max_bytes INTEGER NOT NULL,
            current_target_bytes INTEGER NOT NULL,
            max_slots INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    // One row per slot per VM, including empty ones.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slots (
            vm_name TEXT NOT NULL,
            slot_id INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            backend_name TEXT NOT NULL,
            device_name TEXT NOT NULL,
            state TEXT NOT NULL,
            PRIMARY KEY (vm_name, slot_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(1i64)
        .execute(pool)
        .await
        .map_err(|e| VmemError::MigrationFailed { reason: e.to_string() })?;

    info!("Migration to version 1 complete");
    Ok(())
}
