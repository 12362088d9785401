//! In-memory fakes for storage traits (testing and ephemeral servers)
//!
//! Provides `MemoryLedger`, which satisfies the `RunStore`, `EventLog` and
//! `ResultStore` contracts without any external dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<BattleEvent>,
    results: Option<Vec<AgentResult>>,
}

/// In-memory ledger backed by a `HashMap<RunId, RunState>`.
///
/// A single mutex guards all runs, which serializes sequence assignment.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, RunState>>> {
        self.runs
            .lock()
            .map_err(|_| StorageError::Backend("memory ledger lock poisoned".to_string()))
    }
}

fn not_found(run_id: &RunId) -> StorageError {
    StorageError::RunNotFound {
        run_id: run_id.0.clone(),
    }
}

#[async_trait]
impl RunStore for MemoryLedger {
    async fn create_run(&self, agents: Vec<AgentProfile>) -> StorageResult<RunRecord> {
        let now = Utc::now();
        let record = RunRecord {
            run_id: RunId::new(),
            status: RunStatus::Idle,
            agents,
            target_sandbox_id: None,
            final_health: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut runs = self.lock()?;
        runs.insert(
            record.run_id.0.clone(),
            RunState {
                record: record.clone(),
                events: Vec::new(),
                results: None,
            },
        );
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.lock()?;
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| not_found(run_id))
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
        let mut runs = self.lock()?;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        if state.record.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        state.record.status = to;
        state.record.updated_at = now;
        if to == RunStatus::Running {
            state.record.started_at = Some(now);
        }
        if to.is_terminal() {
            state.record.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn set_target_sandbox(&self, run_id: &RunId, sandbox_id: &str) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        state.record.target_sandbox_id = Some(sandbox_id.to_string());
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_final_health(&self, run_id: &RunId, health: u32) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        state.record.final_health = Some(health);
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let runs = self.lock()?;
        let mut records: Vec<RunRecord> = runs.values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[async_trait]
impl EventLog for MemoryLedger {
    async fn append(&self, run_id: &RunId, event: NewEvent) -> StorageResult<BattleEvent> {
        let mut runs = self.lock()?;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        let stored = BattleEvent {
            seq: state.events.len() as u64 + 1,
            run_id: run_id.clone(),
            kind: event.kind,
            agent_id: event.agent_id,
            message: event.message,
            payload: event.payload,
            timestamp: Utc::now(),
        };
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_since(&self, run_id: &RunId, after_seq: u64) -> StorageResult<Vec<BattleEvent>> {
        let runs = self.lock()?;
        let state = runs.get(&run_id.0).ok_or_else(|| not_found(run_id))?;
        // seq == index + 1, so the suffix starts at `after_seq`
        let start = (after_seq as usize).min(state.events.len());
        Ok(state.events[start..].to_vec())
    }
}

#[async_trait]
impl ResultStore for MemoryLedger {
    async fn record_results(
        &self,
        run_id: &RunId,
        results: Vec<AgentResult>,
    ) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs.get_mut(&run_id.0).ok_or_else(|| not_found(run_id))?;
        if state.results.is_some() {
            return Err(StorageError::ResultsAlreadyRecorded {
                run_id: run_id.0.clone(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = results.iter().find(|r| !seen.insert(r.agent_id.as_str())) {
            return Err(StorageError::Backend(format!(
                "duplicate result for agent {} in run {}",
                dup.agent_id, run_id
            )));
        }
        let mut results = results;
        results.sort_by_key(|r| r.rank);
        state.results = Some(results);
        Ok(())
    }

    async fn results(&self, run_id: &RunId) -> StorageResult<Vec<AgentResult>> {
        let runs = self.lock()?;
        let state = runs.get(&run_id.0).ok_or_else(|| not_found(run_id))?;
        Ok(state.results.clone().unwrap_or_default())
    }
}
