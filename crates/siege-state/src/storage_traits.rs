//! Storage trait definitions for Tower Siege
//!
//! These traits define the persistence seams of the orchestration engine:
//! - `RunStore`: run records and guarded status transitions
//! - `EventLog`: the append-only, per-run sequenced event history
//! - `ResultStore`: per-agent results, written once at finalization
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Which reasoning backend drives an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Google,
    Xai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Xai => "xai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured battle participant. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Identity, also sent as the `X-Agent-ID` header against the tower
    pub id: String,
    /// Display name
    pub name: String,
    /// Reasoning provider
    pub provider: ProviderKind,
    /// Model identifier passed to the provider
    pub model: String,
    /// Display color (CSS hex)
    pub color: String,
}

// ---------------------------------------------------------------------------
// RunStore: run records
// ---------------------------------------------------------------------------

/// Unique identifier for a battle run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Status of a run.
///
/// Transitions: `Idle -> Running -> {Finished, Cancelled}`. A run never
/// re-enters `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Finished,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Idle, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Finished)
                | (RunStatus::Running, RunStatus::Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "finished" => Ok(RunStatus::Finished),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StorageError::Serialization(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Agents supplied at start
    pub agents: Vec<AgentProfile>,
    /// Provider-side identifier of the target sandbox, once provisioned
    pub target_sandbox_id: Option<String>,
    /// Tower health at finalization
    pub final_health: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Run record persistence.
///
/// Guarantees:
/// - Status only moves along [`RunStatus::can_transition_to`] edges.
/// - `transition` is a compare-and-set: concurrent callers racing on the same
///   edge see exactly one `Ok(true)`.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a new run in `Idle` status.
    async fn create_run(&self, agents: Vec<AgentProfile>) -> StorageResult<RunRecord>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Move the run from `from` to `to`.
    ///
    /// Returns `Ok(false)` without changing anything when the current status
    /// is not `from`. Returns `InvalidTransition` when `from -> to` is not a
    /// legal edge.
    async fn transition(&self, run_id: &RunId, from: RunStatus, to: RunStatus)
        -> StorageResult<bool>;

    /// Record the target sandbox identifier.
    async fn set_target_sandbox(&self, run_id: &RunId, sandbox_id: &str) -> StorageResult<()>;

    /// Record the tower health observed at finalization.
    async fn set_final_health(&self, run_id: &RunId, health: u32) -> StorageResult<()>;

    /// List all runs, newest first.
    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>>;
}

// ---------------------------------------------------------------------------
// EventLog: ordered run history
// ---------------------------------------------------------------------------

/// Enumerated event kinds, rendered on the wire as `battle:start` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "battle:start")]
    BattleStart,
    #[serde(rename = "battle:end")]
    BattleEnd,
    #[serde(rename = "tower:setup")]
    TowerSetup,
    #[serde(rename = "tower:status")]
    TowerStatus,
    #[serde(rename = "agent:log")]
    AgentLog,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "agent:thinking")]
    AgentThinking,
    #[serde(rename = "agent:tokens")]
    AgentTokens,
    #[serde(rename = "error")]
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::BattleStart,
        EventKind::BattleEnd,
        EventKind::TowerSetup,
        EventKind::TowerStatus,
        EventKind::AgentLog,
        EventKind::AgentStatus,
        EventKind::AgentThinking,
        EventKind::AgentTokens,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BattleStart => "battle:start",
            EventKind::BattleEnd => "battle:end",
            EventKind::TowerSetup => "tower:setup",
            EventKind::TowerStatus => "tower:status",
            EventKind::AgentLog => "agent:log",
            EventKind::AgentStatus => "agent:status",
            EventKind::AgentThinking => "agent:thinking",
            EventKind::AgentTokens => "agent:tokens",
            EventKind::Error => "error",
        }
    }

    /// The terminal event of a run; nothing follows it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::BattleEnd)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StorageError::Serialization(format!("unknown event kind: {s}")))
    }
}

/// An event to be appended. The log assigns `seq` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub kind: EventKind,
    pub agent_id: Option<String>,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            agent_id: None,
            message: None,
            payload: None,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// One immutable, sequenced fact about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleEvent {
    /// Gapless sequence number within the run, starting at 1
    pub seq: u64,
    pub run_id: RunId,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only run event log.
///
/// Guarantees:
/// - `append` assigns `last + 1` under serialization, so sequence numbers are
///   unique, gapless and start at 1 within a run, even for concurrent callers.
/// - Events are never updated or deleted.
/// - `list_since(run, n)` returns every event with `seq > n` in ascending order.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append an event and return it with its assigned sequence number.
    async fn append(&self, run_id: &RunId, event: NewEvent) -> StorageResult<BattleEvent>;

    /// All events with `seq > after_seq`, ascending. `after_seq = 0` is the full history.
    async fn list_since(&self, run_id: &RunId, after_seq: u64) -> StorageResult<Vec<BattleEvent>>;
}

// ---------------------------------------------------------------------------
// ResultStore: final standings
// ---------------------------------------------------------------------------

/// Per-agent outcome recorded at run finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub agent_id: String,
    pub agent_name: String,
    pub model: String,
    pub color: String,
    /// Hits landed, as counted by the tower
    pub damage: u64,
    /// 1 = most damage
    pub rank: u32,
    /// Reasoning tokens consumed
    pub tokens_used: u64,
}

/// Write-once agent result storage.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert the results for a run. Fails with `ResultsAlreadyRecorded` on a second call.
    async fn record_results(&self, run_id: &RunId, results: Vec<AgentResult>)
        -> StorageResult<()>;

    /// Results for a run ordered by rank. Empty if none were recorded.
    async fn results(&self, run_id: &RunId) -> StorageResult<Vec<AgentResult>>;
}

/// A backend that implements every storage seam.
pub trait BattleLedger: RunStore + EventLog + ResultStore {}

impl<T: RunStore + EventLog + ResultStore> BattleLedger for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        assert!(RunStatus::Idle.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Finished));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Finished.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Idle.can_transition_to(RunStatus::Finished));
        assert!(!RunStatus::Finished.can_transition_to(RunStatus::Cancelled));
    }

    #[test]
    fn test_event_kind_wire_names() {
        for kind in EventKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("battle:middle".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_battle_event_serializes_camel_case() {
        let event = BattleEvent {
            seq: 3,
            run_id: RunId::from("r1"),
            kind: EventKind::AgentLog,
            agent_id: Some("agent-1".into()),
            message: Some("$ nmap".into()),
            payload: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["kind"], "agent:log");
        assert_eq!(json["agentId"], "agent-1");
        assert!(json.get("payload").is_none());
    }
}
