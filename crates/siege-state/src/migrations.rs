//! SurrealDB schema migrations and initialization
//!
//! Sets up the battle tables with their uniqueness constraints and indexes.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all Tower Siege tables.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Tower Siege SurrealDB schema");

    init_runs_table(db).await?;
    init_run_events_table(db).await?;
    init_agent_results_table(db).await?;

    info!("Tower Siege schema initialization complete");
    Ok(())
}

/// Initialize `runs` table
///
/// Schema:
/// ```text
/// TABLE runs {
///   run_id:            STRING (unique)
///   status:            STRING (idle | running | finished | cancelled)
///   agents:            ARRAY<OBJECT>
///   target_sandbox_id: STRING?
///   final_health:      INT?
///   started_at:        DATETIME?
///   finished_at:       DATETIME?
///   created_at:        DATETIME (indexed)
///   updated_at:        DATETIME
/// }
/// ```
///
/// Status transitions are enforced by the ledger, not the database.
async fn init_runs_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX idx_status ON TABLE runs COLUMNS status;
        DEFINE INDEX idx_created_at ON TABLE runs COLUMNS created_at;
    "#;

    db.query(sql).await?;
    info!("runs table initialized");
    Ok(())
}

/// Initialize `run_events` table
///
/// Schema:
/// ```text
/// TABLE run_events {
///   run_id:    STRING
///   seq:       INT (1-indexed, gapless within run)
///   kind:      STRING
///   agent_id:  STRING?
///   message:   STRING?
///   payload:   OBJECT?
///   timestamp: DATETIME
/// }
/// ```
///
/// `(run_id, seq)` is unique: a second writer that somehow computed the same
/// sequence number fails instead of forking history. Rows are never updated
/// or deleted.
async fn init_run_events_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing run_events table");

    let sql = r#"
        DEFINE TABLE run_events AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
        DEFINE INDEX idx_run_id ON TABLE run_events COLUMNS run_id;
        DEFINE INDEX idx_kind ON TABLE run_events COLUMNS kind;
    "#;

    db.query(sql).await?;
    info!("run_events table initialized");
    Ok(())
}

/// Initialize `agent_results` table
///
/// `(run_id, agent_id)` is unique: one row per agent per run.
async fn init_agent_results_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing agent_results table");

    let sql = r#"
        DEFINE TABLE agent_results AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_run_agent ON TABLE agent_results COLUMNS run_id, agent_id UNIQUE;
        DEFINE INDEX idx_run_rank ON TABLE agent_results COLUMNS run_id, rank;
    "#;

    db.query(sql).await?;
    info!("agent_results table initialized");
    Ok(())
}
