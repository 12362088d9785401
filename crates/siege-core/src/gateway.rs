//! Stream gateway: snapshot and resumable live tail of a run's event log.
//!
//! A tail subscribes to the [`EventBus`] *before* reading history, so an
//! event appended in between is seen at least once. The cursor (highest
//! delivered `seq`) drops duplicates; a gap, a lagged receiver, or an idle
//! tick triggers a backfill from the log. Delivery is therefore in order and
//! gap-free from `after + 1` up to the newest stored event.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use siege_state::{BattleEvent, BattleLedger, EventLog, RunId, RunStore};

use crate::config::BattleConfig;
use crate::domain::Result;
use crate::events::EventBus;

#[derive(Clone)]
pub struct StreamGateway {
    ledger: Arc<dyn BattleLedger>,
    bus: EventBus,
    idle_tick: Duration,
    terminal_grace: Duration,
}

async fn backfill(ledger: &Arc<dyn BattleLedger>, run_id: &RunId, cursor: u64) -> Vec<BattleEvent> {
    match ledger.list_since(run_id, cursor).await {
        Ok(events) => events,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "event backfill failed");
            Vec::new()
        }
    }
}

impl StreamGateway {
    pub fn new(ledger: Arc<dyn BattleLedger>, bus: EventBus, config: &BattleConfig) -> Self {
        Self {
            ledger,
            bus,
            idle_tick: config.stream_idle_tick,
            terminal_grace: config.stream_terminal_grace,
        }
    }

    /// Every stored event of a run.
    pub async fn snapshot(&self, run_id: &RunId) -> Result<Vec<BattleEvent>> {
        self.ledger.get_run(run_id).await?;
        Ok(self.ledger.list_since(run_id, 0).await?)
    }

    /// Events with `seq > after`: history first, then live appends. The
    /// stream ends after `battle:end`, or once the run has been terminal for
    /// the grace period without one.
    pub async fn tail(&self, run_id: RunId, after: u64) -> Result<BoxStream<'static, BattleEvent>> {
        let mut rx = self.bus.subscribe();
        self.ledger.get_run(&run_id).await?;

        let ledger = Arc::clone(&self.ledger);
        let idle_tick = self.idle_tick;
        let terminal_grace = self.terminal_grace;

        let stream = async_stream::stream! {
            let mut cursor = after;
            let mut ended = false;
            let mut live = true;
            let mut terminal_since: Option<Instant> = None;

            for event in backfill(&ledger, &run_id, cursor).await {
                cursor = event.seq;
                ended |= event.kind.is_terminal();
                yield event;
            }

            while !ended {
                let (batch, idle) = tokio::select! {
                    received = rx.recv(), if live => match received {
                        Ok(event) if event.run_id != run_id || event.seq <= cursor => (Vec::new(), false),
                        Ok(event) if event.seq == cursor + 1 => (vec![event], false),
                        Ok(event) => {
                            debug!(cursor, seq = event.seq, "gap in live events, backfilling");
                            (backfill(&ledger, &run_id, cursor).await, false)
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(cursor, skipped, "live receiver lagged, backfilling");
                            (backfill(&ledger, &run_id, cursor).await, false)
                        }
                        Err(RecvError::Closed) => {
                            live = false;
                            (backfill(&ledger, &run_id, cursor).await, false)
                        }
                    },
                    _ = tokio::time::sleep(idle_tick) => (backfill(&ledger, &run_id, cursor).await, true),
                };

                let delivered = !batch.is_empty();
                for event in batch {
                    if event.seq <= cursor {
                        continue;
                    }
                    cursor = event.seq;
                    ended |= event.kind.is_terminal();
                    yield event;
                }

                if idle && !delivered && !ended {
                    match ledger.get_run(&run_id).await {
                        Ok(run) if run.status.is_terminal() => {
                            let since = *terminal_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= terminal_grace {
                                debug!(run_id = %run_id, "run terminal without battle:end, closing stream");
                                break;
                            }
                        }
                        Ok(_) => terminal_since = None,
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "run lookup failed, closing stream");
                            break;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
