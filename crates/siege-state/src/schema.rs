//! Schema definitions for the Tower Siege SurrealDB tables
//!
//! Tables:
//! - runs: one row per battle run
//! - run_events: the append-only event log, unique on (run_id, seq)
//! - agent_results: per-agent standings, written once per run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{
    AgentProfile, AgentResult, BattleEvent, EventKind, RunId, RunRecord, RunStatus, StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => serde::Serialize::serialize(&Some(SurrealDatetime::from(*d)), serializer),
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Run row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique run ID (UUID string)
    pub run_id: String,
    /// "idle" | "running" | "finished" | "cancelled"
    pub status: String,
    /// Agents supplied at start
    pub agents: Vec<AgentProfile>,
    pub target_sandbox_id: Option<String>,
    pub final_health: Option<u32>,
    /// Set once `agent_results` rows exist for this run
    #[serde(default)]
    pub results_recorded: bool,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl RunRow {
    /// Create a new run row in "idle" state
    pub fn new(run_id: String, agents: Vec<AgentProfile>) -> Self {
        let now = Utc::now();
        RunRow {
            id: None,
            run_id,
            status: RunStatus::Idle.as_str().to_string(),
            agents,
            target_sandbox_id: None,
            final_health: None,
            results_recorded: false,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> StorageResult<RunStatus> {
        self.status.parse()
    }

    pub fn into_record(self) -> StorageResult<RunRecord> {
        Ok(RunRecord {
            status: self.status()?,
            run_id: RunId(self.run_id),
            agents: self.agents,
            target_sandbox_id: self.target_sandbox_id,
            final_health: self.final_health,
            started_at: self.started_at,
            finished_at: self.finished_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    /// 1-indexed, gapless within run
    pub seq: u64,
    /// Wire name of the kind (e.g. "tower:status")
    pub kind: String,
    pub agent_id: Option<String>,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl EventRow {
    pub fn from_event(event: &BattleEvent) -> Self {
        EventRow {
            id: None,
            run_id: event.run_id.0.clone(),
            seq: event.seq,
            kind: event.kind.as_str().to_string(),
            agent_id: event.agent_id.clone(),
            message: event.message.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
        }
    }

    pub fn into_event(self) -> StorageResult<BattleEvent> {
        Ok(BattleEvent {
            kind: self.kind.parse::<EventKind>()?,
            seq: self.seq,
            run_id: RunId(self.run_id),
            agent_id: self.agent_id,
            message: self.message,
            payload: self.payload,
            timestamp: self.timestamp,
        })
    }
}

/// Agent result row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub model: String,
    pub color: String,
    pub damage: u64,
    pub rank: u32,
    pub tokens_used: u64,
}

impl ResultRow {
    pub fn new(run_id: &RunId, result: AgentResult) -> Self {
        ResultRow {
            id: None,
            run_id: run_id.0.clone(),
            agent_id: result.agent_id,
            agent_name: result.agent_name,
            model: result.model,
            color: result.color,
            damage: result.damage,
            rank: result.rank,
            tokens_used: result.tokens_used,
        }
    }

    pub fn into_result(self) -> AgentResult {
        AgentResult {
            agent_id: self.agent_id,
            agent_name: self.agent_name,
            model: self.model,
            color: self.color,
            damage: self.damage,
            rank: self.rank,
            tokens_used: self.tokens_used,
        }
    }
}
