//! Run controller: the battle state machine.
//!
//! `start_run` accepts a roster, creates the run in `Running` and returns;
//! the battle itself executes on a spawned task:
//!
//! 1. `battle:start`
//! 2. target sandbox (tower service + overlay address), abort on failure
//! 3. agent sandboxes in parallel, tolerating partial failure
//! 4. health monitor + one agent runner per ready agent, joined together
//! 5. final counters, ranking, write-once results
//! 6. teardown of every sandbox, whatever happened before
//! 7. final status, then `battle:end`
//!
//! Every task of a run shares one [`CancellationToken`]. `stop_run` and the
//! health monitor's defeat detection both cancel it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use siege_state::{
    AgentProfile, AgentResult, BattleEvent, BattleLedger, EventKind, EventLog, NewEvent,
    ResultStore, RunId, RunRecord, RunStatus, RunStore, StorageError,
};

use crate::agent_runner::AgentRunner;
use crate::config::BattleConfig;
use crate::domain::{resolve_agents, Result, SiegeError, TowerStats};
use crate::events::{EventSink, RunEmitter};
use crate::health::{HealthMonitor, HealthReport};
use crate::metrics::METRICS;
use crate::obs;
use crate::ranking::rank_agents;
use crate::reasoning::ProviderRegistry;
use crate::sandbox::{ExecOptions, SandboxKey, SandboxLifecycleManager};

/// Read-only view of a run for reconnecting clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub events: Vec<BattleEvent>,
    pub results: Vec<AgentResult>,
}

/// Why a battle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Tower health reached zero
    Defeated,
    /// The run was stopped, or every agent gave up
    Stopped,
    /// Setup failed before the attack phase
    Aborted,
}

struct BattleOutcome {
    final_health: u32,
    defeated: bool,
    reason: EndReason,
    results: Vec<AgentResult>,
}

impl BattleOutcome {
    fn before_attack(initial_health: u32, reason: EndReason) -> Self {
        Self {
            final_health: initial_health,
            defeated: false,
            reason,
            results: Vec::new(),
        }
    }
}

struct Inner {
    ledger: Arc<dyn BattleLedger>,
    sink: Arc<dyn EventSink>,
    sandboxes: Arc<SandboxLifecycleManager>,
    providers: Arc<ProviderRegistry>,
    config: BattleConfig,
    /// Cancellation tokens of runs whose task has not finished
    active: Mutex<HashMap<RunId, CancellationToken>>,
    tasks: Mutex<HashMap<RunId, JoinHandle<()>>>,
}

/// Starts, stops and inspects battles. Cheap to clone.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RunController {
    pub fn new(
        ledger: Arc<dyn BattleLedger>,
        sink: Arc<dyn EventSink>,
        sandboxes: Arc<SandboxLifecycleManager>,
        providers: Arc<ProviderRegistry>,
        config: BattleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                sink,
                sandboxes,
                providers,
                config,
                active: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BattleConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> Arc<dyn BattleLedger> {
        self.inner.ledger.clone()
    }

    /// Create a run for `agents` (the stock roster if `None`) and start its
    /// battle in the background.
    pub async fn start_run(&self, agents: Option<Vec<AgentProfile>>) -> Result<RunId> {
        let agents = resolve_agents(agents)?;
        let ledger = &self.inner.ledger;

        let run = ledger.create_run(agents.clone()).await?;
        let run_id = run.run_id;

        // A stop can land as soon as the run reads `running`; its token must
        // already be registered by then.
        let cancel = CancellationToken::new();
        lock(&self.inner.active).insert(run_id.clone(), cancel.clone());
        let started = ledger
            .transition(&run_id, RunStatus::Idle, RunStatus::Running)
            .await;
        if !matches!(started, Ok(true)) {
            lock(&self.inner.active).remove(&run_id);
            started?;
            return Err(SiegeError::Storage(StorageError::Backend(format!(
                "run {run_id} left idle before it was started"
            ))));
        }

        METRICS.inc_runs_started();
        obs::emit_run_started(run_id.as_str(), agents.len());

        let this = self.clone();
        let task_run_id = run_id.clone();
        let span = obs::run_span(run_id.as_str());
        // The task removes its own entry when done, so insert before it can run to completion.
        let mut tasks = lock(&self.inner.tasks);
        let handle = tokio::spawn(
            async move { this.execute(task_run_id, agents, cancel).await }.instrument(span),
        );
        tasks.insert(run_id.clone(), handle);

        Ok(run_id)
    }

    /// Request cancellation. `Ok(false)` if the run is not running.
    pub async fn stop_run(&self, run_id: &RunId) -> Result<bool> {
        let run = self.inner.ledger.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            debug!(run_id = %run_id, status = %run.status, "stop ignored, run not active");
            return Ok(false);
        }

        let accepted = self
            .inner
            .ledger
            .transition(run_id, RunStatus::Running, RunStatus::Cancelled)
            .await?;
        if accepted {
            if let Some(token) = lock(&self.inner.active).get(run_id) {
                token.cancel();
            }
            info!(run_id = %run_id, "run stop requested");
        }
        Ok(accepted)
    }

    /// Run record, full event history and results.
    pub async fn get_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let ledger = &self.inner.ledger;
        let run = ledger.get_run(run_id).await?;
        let events = ledger.list_since(run_id, 0).await?;
        let results = ledger.results(run_id).await?;
        Ok(RunSnapshot {
            run,
            events,
            results,
        })
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.inner.ledger.list_runs().await?)
    }

    /// Whether the run's battle task is still executing.
    pub fn is_active(&self, run_id: &RunId) -> bool {
        lock(&self.inner.active).contains_key(run_id)
    }

    /// Wait for a run's battle task to finish. Returns immediately if it
    /// already has.
    pub async fn wait(&self, run_id: &RunId) {
        let handle = lock(&self.inner.tasks).remove(run_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(run_id = %run_id, error = %e, "battle task failed");
            }
        }
    }

    /// Stop every running battle and wait for their teardown.
    pub async fn stop_all(&self) {
        let run_ids: Vec<RunId> = lock(&self.inner.active).keys().cloned().collect();
        for run_id in &run_ids {
            if let Err(e) = self.stop_run(run_id).await {
                warn!(run_id = %run_id, error = %e, "failed to stop run");
            }
        }
        for run_id in &run_ids {
            self.wait(run_id).await;
        }
    }

    async fn execute(self, run_id: RunId, agents: Vec<AgentProfile>, cancel: CancellationToken) {
        let started = Instant::now();
        let config = &self.inner.config;
        let ledger = &self.inner.ledger;
        let emitter = RunEmitter::new(run_id.clone(), self.inner.sink.clone());

        emitter
            .emit(
                NewEvent::new(EventKind::BattleStart)
                    .message(format!("Battle starting with {} agents", agents.len()))
                    .payload(json!({
                        "agents": agents,
                        "initialHealth": config.initial_health,
                    })),
            )
            .await;

        let outcome = self.battle(&run_id, &agents, &emitter, &cancel).await;
        cancel.cancel();

        let teardown = self.inner.sandboxes.destroy_all(&run_id).await;
        info!(
            destroyed = teardown.destroyed,
            failed = teardown.failed,
            "sandboxes torn down"
        );
        if teardown.failed > 0 {
            emitter
                .error(
                    None,
                    format!("{} sandbox(es) failed to tear down", teardown.failed),
                )
                .await;
        }

        if let Err(e) = ledger.set_final_health(&run_id, outcome.final_health).await {
            warn!(error = %e, "failed to record final health");
        }

        let settled = if outcome.defeated {
            RunStatus::Finished
        } else {
            RunStatus::Cancelled
        };
        if let Err(e) = ledger
            .transition(&run_id, RunStatus::Running, settled)
            .await
        {
            warn!(error = %e, "failed to settle run status");
        }
        let status = match ledger.get_run(&run_id).await {
            Ok(run) => run.status,
            Err(e) => {
                warn!(error = %e, "failed to read final run status");
                settled
            }
        };
        let cancelled = status == RunStatus::Cancelled;

        let message = match outcome.reason {
            EndReason::Defeated => "Battle finished! The tower has fallen.",
            EndReason::Stopped => "Battle stopped.",
            EndReason::Aborted => "Battle aborted before agent execution",
        };
        emitter
            .emit(
                NewEvent::new(EventKind::BattleEnd)
                    .message(message)
                    .payload(json!({
                        "cancelled": cancelled,
                        "defeated": outcome.defeated,
                        "finalHealth": outcome.final_health,
                        "reason": outcome.reason,
                        "results": outcome.results,
                    })),
            )
            .await;

        METRICS.inc_runs_finished();
        METRICS.flush();
        obs::emit_run_finished(
            run_id.as_str(),
            started.elapsed().as_millis() as u64,
            outcome.final_health,
            cancelled,
        );

        lock(&self.inner.active).remove(&run_id);
        lock(&self.inner.tasks).remove(&run_id);
    }

    async fn battle(
        &self,
        run_id: &RunId,
        agents: &[AgentProfile],
        emitter: &RunEmitter,
        cancel: &CancellationToken,
    ) -> BattleOutcome {
        let config = &self.inner.config;
        let sandboxes = &self.inner.sandboxes;
        let initial = config.initial_health;

        emitter
            .tower_setup("Initializing tower sandbox environment...")
            .await;
        let target = match sandboxes.create_target_sandbox(run_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "tower sandbox failed");
                emitter
                    .error(None, format!("Tower sandbox failed: {e}"))
                    .await;
                return BattleOutcome::before_attack(initial, EndReason::Aborted);
            }
        };
        if let Err(e) = self
            .inner
            .ledger
            .set_target_sandbox(run_id, target.id())
            .await
        {
            warn!(error = %e, "failed to record target sandbox");
        }
        let Some(tower_address) = target.address.clone() else {
            emitter
                .error(None, "Tower sandbox has no overlay address; agents cannot reach it")
                .await;
            return BattleOutcome::before_attack(initial, EndReason::Aborted);
        };
        emitter
            .tower_setup(format!(
                "Tower sandbox ready at {tower_address}. Port {} exposed.",
                config.tower_port
            ))
            .await;
        if cancel.is_cancelled() {
            return BattleOutcome::before_attack(initial, EndReason::Stopped);
        }

        let ready = self.provision_agents(run_id, agents, emitter).await;
        let attackers: Vec<AgentProfile> = agents
            .iter()
            .filter(|a| ready.contains(&a.id))
            .cloned()
            .collect();
        if attackers.is_empty() {
            emitter
                .error(None, "No agent sandbox could be provisioned")
                .await;
            return BattleOutcome::before_attack(initial, EndReason::Aborted);
        }
        if cancel.is_cancelled() {
            return BattleOutcome::before_attack(initial, EndReason::Stopped);
        }

        let (report, tokens) = self
            .fight(attackers, tower_address, emitter, cancel)
            .await;

        let stats = self.final_stats(run_id).await.or(report.last_stats).unwrap_or_default();
        let results = rank_agents(agents, &stats, &tokens);
        if let Err(e) = self
            .inner
            .ledger
            .record_results(run_id, results.clone())
            .await
        {
            warn!(error = %e, "failed to record results");
            emitter
                .error(None, format!("Failed to record results: {e}"))
                .await;
        }

        BattleOutcome {
            final_health: report.final_health,
            defeated: report.defeated,
            reason: if report.defeated {
                EndReason::Defeated
            } else {
                EndReason::Stopped
            },
            results,
        }
    }

    /// Provision every agent sandbox concurrently. Returns the ids that succeeded.
    async fn provision_agents(
        &self,
        run_id: &RunId,
        agents: &[AgentProfile],
        emitter: &RunEmitter,
    ) -> HashSet<String> {
        let mut join_set = JoinSet::new();
        for agent in agents {
            let sandboxes = Arc::clone(&self.inner.sandboxes);
            let run_id = run_id.clone();
            let agent_id = agent.id.clone();
            join_set.spawn(async move {
                let result = sandboxes.create_agent_sandbox(&run_id, &agent_id).await;
                (agent_id, result)
            });
        }

        let mut ready = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((agent_id, Ok(handle))) => {
                    emitter
                        .agent_log(
                            &agent_id,
                            format!(
                                "Sandbox ready ({})",
                                handle.address.as_deref().unwrap_or("no overlay address")
                            ),
                        )
                        .await;
                    ready.insert(agent_id);
                }
                Ok((agent_id, Err(e))) => {
                    warn!(agent_id = %agent_id, error = %e, "agent sandbox failed");
                    emitter
                        .error(Some(&agent_id), format!("Agent sandbox failed: {e}"))
                        .await;
                }
                Err(e) => warn!(error = %e, "agent provisioning task failed"),
            }
        }
        ready
    }

    /// Run the health monitor and the agent runners until the token is
    /// cancelled. Returns the monitor's report and tokens used per agent.
    async fn fight(
        &self,
        attackers: Vec<AgentProfile>,
        tower_address: String,
        emitter: &RunEmitter,
        cancel: &CancellationToken,
    ) -> (HealthReport, HashMap<String, u64>) {
        let config = &self.inner.config;

        let monitor = HealthMonitor::new(
            Arc::clone(&self.inner.sandboxes),
            Arc::clone(&self.inner.ledger),
            emitter.clone(),
            config.clone(),
            cancel.clone(),
        );
        let monitor_task = tokio::spawn(monitor.run().in_current_span());

        let mut runners = JoinSet::new();
        for agent in attackers {
            let runner = AgentRunner::new(
                agent,
                Arc::clone(&self.inner.providers),
                Arc::clone(&self.inner.sandboxes),
                tower_address.clone(),
                emitter.clone(),
                config.clone(),
                cancel.clone(),
            );
            runners.spawn(runner.run().in_current_span());
        }

        let mut tokens = HashMap::new();
        while let Some(joined) = runners.join_next().await {
            match joined {
                Ok(outcome) => {
                    tokens.insert(outcome.agent_id, outcome.usage.total());
                }
                Err(e) => warn!(error = %e, "agent runner failed"),
            }
        }
        if !cancel.is_cancelled() {
            emitter
                .error(None, "Every agent has stopped; ending battle")
                .await;
            cancel.cancel();
        }

        let report = match monitor_task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "health monitor failed");
                HealthReport {
                    final_health: config.initial_health,
                    defeated: false,
                    last_stats: None,
                }
            }
        };
        (report, tokens)
    }

    /// One last stats read after the loops have stopped.
    async fn final_stats(&self, run_id: &RunId) -> Option<TowerStats> {
        let command = HealthMonitor::stats_command(self.inner.config.tower_port);
        let out = self
            .inner
            .sandboxes
            .exec(&SandboxKey::target(run_id), &command, ExecOptions::default())
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        serde_json::from_str(out.output.trim()).ok()
    }
}
