//! Sandbox lifecycle manager: the only owner of live sandbox handles.
//!
//! Handles are registered under a `(run, role, agent)` key the moment the
//! provisioner returns them, so a failure later in setup still leaves the
//! sandbox visible to [`SandboxLifecycleManager::destroy_all`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use siege_state::RunId;

use super::error::{SandboxError, SandboxResult};
use super::overlay::OverlayNetwork;
use super::provisioner::{ExecOptions, ExecOutput, Sandbox, SandboxProvisioner, SandboxRole, SandboxSpec};
use crate::config::BattleConfig;
use crate::metrics::METRICS;
use crate::obs;

/// Registry key for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxKey {
    pub run_id: RunId,
    pub role: SandboxRole,
    pub agent_id: Option<String>,
}

impl SandboxKey {
    pub fn target(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
            role: SandboxRole::Target,
            agent_id: None,
        }
    }

    pub fn agent(run_id: &RunId, agent_id: &str) -> Self {
        Self {
            run_id: run_id.clone(),
            role: SandboxRole::Agent,
            agent_id: Some(agent_id.to_string()),
        }
    }

    /// Overlay hostname: `tower-<run>` or `agent-<id>-<run>`.
    pub fn hostname(&self) -> String {
        match &self.agent_id {
            Some(agent_id) => format!("agent-{}-{}", agent_id, self.run_id),
            None => format!("tower-{}", self.run_id),
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent_id {
            Some(agent_id) => write!(f, "{}/{}/{}", self.run_id, self.role, agent_id),
            None => write!(f, "{}/{}", self.run_id, self.role),
        }
    }
}

/// A live sandbox plus its overlay address, if it joined.
#[derive(Clone)]
pub struct SandboxHandle {
    pub sandbox: Arc<dyn Sandbox>,
    pub address: Option<String>,
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        self.sandbox.id()
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.sandbox.id())
            .field("address", &self.address)
            .finish()
    }
}

/// Outcome of [`SandboxLifecycleManager::destroy_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub destroyed: usize,
    pub failed: usize,
}

/// Creates, looks up, and destroys the sandboxes of every run.
pub struct SandboxLifecycleManager {
    provisioner: Arc<dyn SandboxProvisioner>,
    overlay: Arc<dyn OverlayNetwork>,
    config: BattleConfig,
    handles: Mutex<HashMap<SandboxKey, SandboxHandle>>,
}

impl SandboxLifecycleManager {
    pub fn new(
        provisioner: Arc<dyn SandboxProvisioner>,
        overlay: Arc<dyn OverlayNetwork>,
        config: BattleConfig,
    ) -> Self {
        Self {
            provisioner,
            overlay,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    // Nothing panics while holding this lock, so a poisoned map is still consistent.
    fn handles(&self) -> MutexGuard<'_, HashMap<SandboxKey, SandboxHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, key: SandboxKey, handle: SandboxHandle) {
        self.handles().insert(key, handle);
    }

    fn spec(&self, key: &SandboxKey) -> SandboxSpec {
        SandboxSpec {
            label: key.hostname(),
            vcpus: self.config.sandbox_vcpus,
            timeout: self.config.sandbox_timeout,
            exposed_port: match key.role {
                SandboxRole::Target => Some(self.config.tower_port),
                SandboxRole::Agent => None,
            },
            runtime: None,
        }
    }

    async fn provision(&self, key: &SandboxKey) -> SandboxResult<Arc<dyn Sandbox>> {
        let sandbox = self.provisioner.create(self.spec(key)).await?;
        METRICS.inc_sandboxes_created();
        obs::emit_sandbox_created(key.run_id.as_str(), key.role.as_str(), sandbox.id());
        self.register(
            key.clone(),
            SandboxHandle {
                sandbox: sandbox.clone(),
                address: None,
            },
        );
        Ok(sandbox)
    }

    /// Provision the tower sandbox, start the tower service, wait for it to
    /// answer health checks, and join it to the overlay.
    ///
    /// The returned handle has `address: None` if the overlay join failed.
    pub async fn create_target_sandbox(&self, run_id: &RunId) -> SandboxResult<SandboxHandle> {
        let key = SandboxKey::target(run_id);
        let sandbox = self.provision(&key).await?;

        let start = self.config.tower_start_command();
        debug!(run_id = %run_id, command = %start, "starting tower service");
        sandbox.exec(&start, ExecOptions::background()).await?;
        self.wait_for_tower(sandbox.as_ref()).await?;

        let address = self.overlay.join(sandbox.as_ref(), &key.hostname()).await;
        let handle = SandboxHandle { sandbox, address };
        self.register(key, handle.clone());
        info!(run_id = %run_id, sandbox_id = %handle.id(), address = ?handle.address, "tower sandbox ready");
        Ok(handle)
    }

    async fn wait_for_tower(&self, sandbox: &dyn Sandbox) -> SandboxResult<()> {
        let probe = format!(
            "curl -sf --max-time 2 http://localhost:{}/health",
            self.config.tower_port
        );
        for attempt in 1..=self.config.tower_ready_attempts {
            if let Ok(out) = sandbox.exec(&probe, ExecOptions::default()).await {
                if out.success() {
                    debug!(attempt, "tower answered health check");
                    return Ok(());
                }
            }
            tokio::time::sleep(self.config.tower_ready_delay).await;
        }
        Err(SandboxError::Timeout {
            what: "tower health check".to_string(),
            elapsed_ms: self.config.tower_ready_delay.as_millis() as u64
                * u64::from(self.config.tower_ready_attempts),
        })
    }

    /// Provision an agent sandbox and join it to the overlay. No service is started.
    pub async fn create_agent_sandbox(
        &self,
        run_id: &RunId,
        agent_id: &str,
    ) -> SandboxResult<SandboxHandle> {
        let key = SandboxKey::agent(run_id, agent_id);
        let sandbox = self.provision(&key).await?;
        let address = self.overlay.join(sandbox.as_ref(), &key.hostname()).await;
        let handle = SandboxHandle { sandbox, address };
        self.register(key, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, key: &SandboxKey) -> Option<SandboxHandle> {
        self.handles().get(key).cloned()
    }

    /// Run a command in the sandbox registered under `key`.
    pub async fn exec(
        &self,
        key: &SandboxKey,
        command: &str,
        options: ExecOptions,
    ) -> SandboxResult<ExecOutput> {
        let handle = self
            .get(key)
            .ok_or_else(|| SandboxError::NotFound(key.to_string()))?;
        handle.sandbox.exec(command, options).await
    }

    /// Number of live handles registered for a run.
    pub fn count(&self, run_id: &RunId) -> usize {
        self.handles().keys().filter(|k| &k.run_id == run_id).count()
    }

    /// Destroy every sandbox of a run. Entries are removed whether or not
    /// their destroy call succeeds; failures are logged and counted.
    pub async fn destroy_all(&self, run_id: &RunId) -> TeardownReport {
        let doomed: Vec<(SandboxKey, SandboxHandle)> = {
            let mut handles = self.handles();
            let keys: Vec<SandboxKey> = handles
                .keys()
                .filter(|k| &k.run_id == run_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| handles.remove(&k).map(|h| (k, h)))
                .collect()
        };

        let mut report = TeardownReport::default();
        for (key, handle) in doomed {
            match handle.sandbox.destroy().await {
                Ok(()) => {
                    report.destroyed += 1;
                    obs::emit_sandbox_destroyed(run_id.as_str(), key.role.as_str(), handle.id());
                }
                Err(e) => {
                    report.failed += 1;
                    METRICS.inc_teardown_failures();
                    obs::emit_teardown_error(run_id.as_str(), handle.id(), &e);
                }
            }
        }
        report
    }
}
