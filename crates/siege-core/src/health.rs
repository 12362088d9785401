//! Health monitor: polls the tower's counters and declares defeat.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use siege_state::{BattleLedger, EventKind, NewEvent, RunStatus, RunStore};

use crate::config::BattleConfig;
use crate::domain::{HealthTracker, TowerStats};
use crate::events::RunEmitter;
use crate::sandbox::{ExecOptions, SandboxKey, SandboxLifecycleManager};

/// How the monitor left its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub final_health: u32,
    pub defeated: bool,
    /// Last successful stats reading, if any
    pub last_stats: Option<TowerStats>,
}

pub struct HealthMonitor {
    sandboxes: Arc<SandboxLifecycleManager>,
    ledger: Arc<dyn BattleLedger>,
    emitter: RunEmitter,
    config: BattleConfig,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        sandboxes: Arc<SandboxLifecycleManager>,
        ledger: Arc<dyn BattleLedger>,
        emitter: RunEmitter,
        config: BattleConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sandboxes,
            ledger,
            emitter,
            config,
            cancel,
        }
    }

    /// Command that prints the tower's stats inside the target sandbox.
    pub fn stats_command(port: u16) -> String {
        format!("curl -s --max-time 2 http://localhost:{port}/stats")
    }

    /// Read the tower's counters. Any failure is "no reading this tick".
    async fn read_stats(&self) -> Option<TowerStats> {
        let key = SandboxKey::target(self.emitter.run_id());
        let command = Self::stats_command(self.config.tower_port);
        match self.sandboxes.exec(&key, &command, ExecOptions::default()).await {
            Ok(out) if out.success() => match serde_json::from_str(out.output.trim()) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(error = %e, "unparseable tower stats");
                    None
                }
            },
            Ok(out) => {
                debug!(exit_code = out.exit_code, "tower stats read failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "tower stats read failed");
                None
            }
        }
    }

    /// Poll until the tower is defeated or the run's token is cancelled.
    ///
    /// On defeat the run is moved `Running -> Finished` and the token is
    /// cancelled so every agent runner stops.
    pub async fn run(self) -> HealthReport {
        let run_id = self.emitter.run_id().clone();
        let mut tracker = HealthTracker::new(self.config.initial_health, self.config.damage_per_request);
        let mut last_stats: Option<TowerStats> = None;

        while !self.cancel.is_cancelled() {
            if let Some(stats) = self.read_stats().await {
                if let Some(health) = tracker.observe(stats.total_requests) {
                    let state = tracker.state();
                    self.emitter
                        .emit(
                            NewEvent::new(EventKind::TowerStatus)
                                .message(format!("Tower health: {health}"))
                                .payload(json!({
                                    "health": health,
                                    "maxHealth": self.config.initial_health,
                                    "totalRequests": stats.total_requests,
                                    "agents": stats.agents,
                                    "status": state,
                                })),
                        )
                        .await;
                }
                last_stats = Some(stats);

                if tracker.is_defeated() {
                    match self
                        .ledger
                        .transition(&run_id, RunStatus::Running, RunStatus::Finished)
                        .await
                    {
                        Ok(true) => info!(run_id = %run_id, "tower defeated"),
                        Ok(false) => debug!(run_id = %run_id, "tower defeated after run left running"),
                        Err(e) => warn!(run_id = %run_id, error = %e, "failed to finish run"),
                    }
                    self.cancel.cancel();
                    break;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.health_poll_interval) => {}
            }
        }

        HealthReport {
            final_health: tracker.health(),
            defeated: tracker.is_defeated(),
            last_stats,
        }
    }
}
