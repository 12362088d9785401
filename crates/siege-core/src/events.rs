//! Event emission: one write path for every component.
//!
//! Components hold an [`EventSink`] (usually through a run-bound
//! [`RunEmitter`]). The production sink, [`LedgerSink`], appends to the
//! [`EventLog`] first and only then publishes the stored event on the
//! in-process [`EventBus`], so a live subscriber never sees an event that is
//! missing from history.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use siege_state::{BattleEvent, EventKind, EventLog, NewEvent, RunId};

use crate::domain::error::Result;
use crate::metrics::METRICS;
use crate::obs;

/// Broadcast fan-out of stored events to live stream subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BattleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(2048)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BattleEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: BattleEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The single write path for run events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist an event and make it visible to live readers.
    async fn emit(&self, run_id: &RunId, event: NewEvent) -> Result<BattleEvent>;
}

/// Persists to an [`EventLog`], then publishes on an [`EventBus`].
pub struct LedgerSink {
    log: Arc<dyn EventLog>,
    bus: EventBus,
}

impl LedgerSink {
    pub fn new(log: Arc<dyn EventLog>, bus: EventBus) -> Self {
        Self { log, bus }
    }
}

#[async_trait]
impl EventSink for LedgerSink {
    async fn emit(&self, run_id: &RunId, event: NewEvent) -> Result<BattleEvent> {
        let stored = self.log.append(run_id, event).await?;
        METRICS.inc_events_appended();
        obs::emit_event_appended(run_id.as_str(), stored.kind.as_str(), stored.seq);
        self.bus.publish(stored.clone());
        Ok(stored)
    }
}

/// An [`EventSink`] bound to one run, with shorthands for the common kinds.
///
/// Emission failures are logged and swallowed: losing visibility into a run
/// must never take the run down.
#[derive(Clone)]
pub struct RunEmitter {
    run_id: RunId,
    sink: Arc<dyn EventSink>,
}

impl RunEmitter {
    pub fn new(run_id: RunId, sink: Arc<dyn EventSink>) -> Self {
        Self { run_id, sink }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn emit(&self, event: NewEvent) -> Option<BattleEvent> {
        let kind = event.kind;
        match self.sink.emit(&self.run_id, event).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(run_id = %self.run_id, kind = %kind, error = %e, "failed to emit event");
                None
            }
        }
    }

    pub async fn tower_setup(&self, message: impl Into<String>) {
        self.emit(NewEvent::new(EventKind::TowerSetup).message(message))
            .await;
    }

    pub async fn error(&self, agent_id: Option<&str>, message: impl Into<String>) {
        let mut event = NewEvent::new(EventKind::Error).message(message);
        if let Some(agent_id) = agent_id {
            event = event.agent(agent_id);
        }
        self.emit(event).await;
    }

    pub async fn agent_log(&self, agent_id: &str, message: impl Into<String>) {
        self.emit(NewEvent::new(EventKind::AgentLog).agent(agent_id).message(message))
            .await;
    }

    pub async fn agent_status(&self, agent_id: &str, status: &str) {
        self.emit(
            NewEvent::new(EventKind::AgentStatus)
                .agent(agent_id)
                .payload(json!({ "status": status })),
        )
        .await;
    }

    pub async fn agent_thinking(&self, agent_id: &str, text: impl Into<String>) {
        self.emit(
            NewEvent::new(EventKind::AgentThinking)
                .agent(agent_id)
                .message(text),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use siege_state::fakes::MemoryLedger;
    use siege_state::RunStore;

    use super::*;

    #[tokio::test]
    async fn test_sink_persists_then_broadcasts() {
        let ledger = Arc::new(MemoryLedger::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sink = LedgerSink::new(ledger.clone(), bus.clone());

        let run = ledger.create_run(vec![]).await.unwrap();
        let stored = sink
            .emit(&run.run_id, NewEvent::new(EventKind::BattleStart))
            .await
            .unwrap();

        let live = rx.recv().await.unwrap();
        assert_eq!(live, stored);
        let history = ledger.list_since(&run.run_id, 0).await.unwrap();
        assert_eq!(history, vec![stored]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let ledger = Arc::new(MemoryLedger::new());
        let sink = LedgerSink::new(ledger.clone(), EventBus::new());
        let run = ledger.create_run(vec![]).await.unwrap();
        assert_eq!(
            sink.emit(&run.run_id, NewEvent::new(EventKind::TowerSetup))
                .await
                .unwrap()
                .seq,
            1
        );
    }

    #[tokio::test]
    async fn test_emitter_swallows_storage_errors() {
        let ledger = Arc::new(MemoryLedger::new());
        let sink = Arc::new(LedgerSink::new(ledger, EventBus::new()));
        let emitter = RunEmitter::new(RunId::from("missing"), sink);
        assert!(emitter
            .emit(NewEvent::new(EventKind::BattleStart))
            .await
            .is_none());
        emitter.agent_log("agent-1", "still fine").await;
    }

    #[tokio::test]
    async fn test_agent_status_payload() {
        let ledger = Arc::new(MemoryLedger::new());
        let sink = Arc::new(LedgerSink::new(ledger.clone(), EventBus::new()));
        let run = ledger.create_run(vec![]).await.unwrap();
        let emitter = RunEmitter::new(run.run_id.clone(), sink);

        emitter.agent_status("agent-2", "starting").await;
        let events = ledger.list_since(&run.run_id, 0).await.unwrap();
        assert_eq!(events[0].kind, EventKind::AgentStatus);
        assert_eq!(events[0].agent_id.as_deref(), Some("agent-2"));
        assert_eq!(events[0].payload.as_ref().unwrap()["status"], "starting");
    }
}
