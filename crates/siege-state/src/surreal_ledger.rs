//! SurrealDB-backed ledger implementation
//!
//! Uses `schema::{RunRow, EventRow, ResultRow}` for persistence, converting
//! to/from `storage_traits` types at the boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::schema::{EventRow, ResultRow, RunRow};
use crate::storage_traits::{
    AgentProfile, AgentResult, BattleEvent, EventLog, NewEvent, ResultStore, RunId, RunRecord,
    RunStatus, RunStore, StorageResult,
};

const DEFAULT_NAMESPACE: &str = "siege";
const DEFAULT_DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".siege/db";

fn backend(err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[derive(Debug, Deserialize)]
struct SeqOnly {
    seq: u64,
}

/// SurrealDB-backed implementation of [`RunStore`], [`EventLog`] and [`ResultStore`].
///
/// All mutations go through `writes`, which also caches the last assigned
/// sequence number of each running run. That lock is what makes sequence
/// assignment gapless under concurrent appenders; the `(run_id, seq)` unique
/// index is the backstop. Terminal runs are not cached: their few remaining
/// appends re-read the last sequence number.
pub struct SurrealLedger {
    db: Surreal<Any>,
    writes: Mutex<HashMap<String, u64>>,
}

impl SurrealLedger {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `siege/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url).await.map_err(backend)?;
        Self::init(db, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
    }

    /// Create from environment variables.
    ///
    /// - `SIEGE_DB_URL`: endpoint (default: local `surrealkv://.siege/db`)
    /// - `SIEGE_DB_USER` / `SIEGE_DB_PASS`: optional root credentials
    /// - `SIEGE_DB_NS` / `SIEGE_DB_NAME`: namespace and database
    pub async fn from_env() -> StorageResult<Self> {
        let url = match std::env::var("SIEGE_DB_URL") {
            Ok(url) => url,
            Err(_) => {
                std::fs::create_dir_all(DEFAULT_LOCAL_PATH).map_err(|e| {
                    StorageError::Backend(format!(
                        "Failed to create database directory {}: {}",
                        DEFAULT_LOCAL_PATH, e
                    ))
                })?;
                let url = format!("surrealkv://{}", DEFAULT_LOCAL_PATH);
                info!("No SIEGE_DB_URL found, using local persistence: {}", url);
                url
            }
        };

        let db = surrealdb::engine::any::connect(&url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect to {}: {}", url, e)))?;

        if let (Ok(username), Ok(password)) =
            (std::env::var("SIEGE_DB_USER"), std::env::var("SIEGE_DB_PASS"))
        {
            db.signin(Root {
                username: &username,
                password: &password,
            })
            .await
            .map_err(|e| StorageError::Backend(format!("Root auth failed: {e}")))?;
        }

        let ns = std::env::var("SIEGE_DB_NS").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let name = std::env::var("SIEGE_DB_NAME").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let ledger = Self::init(db, &ns, &name).await?;
        info!("SurrealLedger connected ({})", url);
        Ok(ledger)
    }

    async fn init(db: Surreal<Any>, ns: &str, name: &str) -> StorageResult<Self> {
        db.use_ns(ns).use_db(name).await.map_err(backend)?;
        migrations::init_schema(&db).await?;
        Ok(Self {
            db,
            writes: Mutex::new(HashMap::new()),
        })
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a run row by ID, or RunNotFound.
    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRow> {
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Highest stored sequence number for a run, 0 if it has no events.
    async fn fetch_last_seq(&self, rid: &str) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("SELECT seq FROM run_events WHERE run_id = $rid ORDER BY seq DESC LIMIT 1")
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<SeqOnly> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|r| r.seq).unwrap_or(0))
    }

    async fn update_run(
        &self,
        sql: &str,
        rid: &str,
        field: &'static str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        self.db
            .query(sql)
            .bind(("rid", rid.to_string()))
            .bind((field, value))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SurrealLedger {
    async fn create_run(&self, agents: Vec<AgentProfile>) -> StorageResult<RunRecord> {
        let run_id = RunId::new();
        let row = RunRow::new(run_id.0.clone(), agents);

        debug!(run_id = %run_id, "creating run");

        let _guard = self.writes.lock().await;
        let _created: Option<RunRow> = self
            .db
            .create("runs")
            .content(row.clone())
            .await
            .map_err(backend)?;

        row.into_record()
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.fetch_run(&run_id.0).await?.into_record()
    }

    async fn transition(
        &self,
        run_id: &RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> StorageResult<bool> {
        if !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                run_id: run_id.0.clone(),
                from,
                to,
            });
        }

        let mut writes = self.writes.lock().await;
        let row = self.fetch_run(&run_id.0).await?;
        if row.status()? != from {
            return Ok(false);
        }
        if to.is_terminal() {
            writes.remove(&run_id.0);
        }

        let mut sql = String::from("UPDATE runs SET status = $status, updated_at = $now");
        if to == RunStatus::Running {
            sql.push_str(", started_at = $now");
        }
        if to.is_terminal() {
            sql.push_str(", finished_at = $now");
        }
        sql.push_str(" WHERE run_id = $rid");

        debug!(run_id = %run_id, from = %from, to = %to, "transitioning run");
        self.update_run(&sql, &run_id.0, "status", to.as_str().into())
            .await?;
        Ok(true)
    }

    async fn set_target_sandbox(&self, run_id: &RunId, sandbox_id: &str) -> StorageResult<()> {
        let _guard = self.writes.lock().await;
        self.fetch_run(&run_id.0).await?;
        self.update_run(
            "UPDATE runs SET target_sandbox_id = $sandbox, updated_at = $now WHERE run_id = $rid",
            &run_id.0,
            "sandbox",
            sandbox_id.into(),
        )
        .await
    }

    async fn set_final_health(&self, run_id: &RunId, health: u32) -> StorageResult<()> {
        let _guard = self.writes.lock().await;
        self.fetch_run(&run_id.0).await?;
        self.update_run(
            "UPDATE runs SET final_health = $health, updated_at = $now WHERE run_id = $rid",
            &run_id.0,
            "health",
            health.into(),
        )
        .await
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM runs ORDER BY created_at DESC")
            .await
            .map_err(backend)?;
        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(RunRow::into_record).collect()
    }
}

#[async_trait]
impl EventLog for SurrealLedger {
    async fn append(&self, run_id: &RunId, event: NewEvent) -> StorageResult<BattleEvent> {
        let mut writes = self.writes.lock().await;

        let (last, cache) = match writes.get(&run_id.0) {
            Some(last) => (*last, true),
            None => {
                let row = self.fetch_run(&run_id.0).await?;
                let last = self.fetch_last_seq(&run_id.0).await?;
                (last, !row.status()?.is_terminal())
            }
        };

        let stored = BattleEvent {
            seq: last + 1,
            run_id: run_id.clone(),
            kind: event.kind,
            agent_id: event.agent_id,
            message: event.message,
            payload: event.payload,
            timestamp: Utc::now(),
        };

        let created: Result<Option<EventRow>, surrealdb::Error> = self
            .db
            .create("run_events")
            .content(EventRow::from_event(&stored))
            .await;
        if let Err(e) = created {
            // The cached counter may be stale; re-read on next append.
            writes.remove(&run_id.0);
            let msg = e.to_string();
            if msg.contains("idx_run_id_seq") {
                return Err(StorageError::DuplicateSequence {
                    run_id: run_id.0.clone(),
                    seq: stored.seq,
                });
            }
            return Err(StorageError::Backend(msg));
        }

        if cache {
            writes.insert(run_id.0.clone(), stored.seq);
        }
        Ok(stored)
    }

    async fn list_since(&self, run_id: &RunId, after_seq: u64) -> StorageResult<Vec<BattleEvent>> {
        self.fetch_run(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid AND seq > $after ORDER BY seq ASC")
            .bind(("rid", run_id.0.clone()))
            .bind(("after", after_seq))
            .await
            .map_err(backend)?;

        let rows: Vec<EventRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}

#[async_trait]
impl ResultStore for SurrealLedger {
    async fn record_results(
        &self,
        run_id: &RunId,
        results: Vec<AgentResult>,
    ) -> StorageResult<()> {
        let _guard = self.writes.lock().await;
        let row = self.fetch_run(&run_id.0).await?;
        if row.results_recorded {
            return Err(StorageError::ResultsAlreadyRecorded {
                run_id: run_id.0.clone(),
            });
        }

        let rows = results
            .into_iter()
            .map(|result| {
                let mut row = serde_json::to_value(ResultRow::new(run_id, result))?;
                if let Some(fields) = row.as_object_mut() {
                    fields.remove("id");
                }
                Ok(row)
            })
            .collect::<StorageResult<Vec<serde_json::Value>>>()?;

        // One transaction: either every row and the flag land, or nothing does.
        self.db
            .query(
                "BEGIN TRANSACTION;
                 FOR $row IN $rows { CREATE agent_results CONTENT $row; };
                 UPDATE runs SET results_recorded = true, updated_at = $now WHERE run_id = $rid;
                 COMMIT TRANSACTION;",
            )
            .bind(("rows", rows))
            .bind(("rid", run_id.0.clone()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn results(&self, run_id: &RunId) -> StorageResult<Vec<AgentResult>> {
        self.fetch_run(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM agent_results WHERE run_id = $rid ORDER BY rank ASC")
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<ResultRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(ResultRow::into_result).collect())
    }
}
