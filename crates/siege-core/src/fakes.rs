//! In-process fakes for the orchestrator's external collaborators.
//!
//! [`FakeProvisioner`] hands out [`FakeSandbox`]es that answer the commands
//! the engine itself issues (tower health probe, stats read) and count
//! `/hello` requests into a shared [`TowerCounters`], so a whole battle can
//! run without processes or a network. [`ScriptedProvider`] replays a queue of
//! reasoning steps.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::TowerStats;
use crate::reasoning::{
    FinishReason, ProviderResult, ReasoningProvider, ReasoningStep, StepRequest, ToolCall, Turn,
    Usage, BASH_TOOL_NAME,
};
use crate::sandbox::{
    ExecOptions, ExecOutput, NetworkAddress, Sandbox, SandboxError, SandboxProvisioner,
    SandboxResult, SandboxRole, SandboxSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tower counters
// ---------------------------------------------------------------------------

/// The tower's per-identity hit map, shared by every fake sandbox of a provisioner.
#[derive(Debug, Default)]
pub struct TowerCounters {
    stats: Mutex<TowerStats>,
    down: AtomicBool,
}

impl TowerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one hit. Returns `(hits for agent, total)`.
    pub fn hit(&self, agent_id: &str) -> (u64, u64) {
        let mut stats = lock(&self.stats);
        let count = stats.agents.entry(agent_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        stats.total_requests += 1;
        (count, stats.total_requests)
    }

    /// Inject `n` hits for an agent at once.
    pub fn add(&self, agent_id: &str, n: u64) {
        let mut stats = lock(&self.stats);
        *stats.agents.entry(agent_id.to_string()).or_insert(0) += n;
        stats.total_requests += n;
    }

    pub fn stats(&self) -> TowerStats {
        lock(&self.stats).clone()
    }

    /// While down, health probes and stats reads fail as if nothing listened.
    pub fn set_tower_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// A sandbox that pretends to run the tower and curl.
#[derive(Debug)]
pub struct FakeSandbox {
    id: String,
    host: String,
    role: SandboxRole,
    label: String,
    counters: Arc<TowerCounters>,
    commands: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
    destroyed: AtomicBool,
    fail_destroy: bool,
}

impl FakeSandbox {
    pub fn role(&self) -> SandboxRole {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// The subset of [`commands`](Self::commands) that was started detached.
    pub fn detached_commands(&self) -> Vec<String> {
        lock(&self.detached).clone()
    }

    fn respond(&self, command: &str) -> ExecOutput {
        let probes_tower = command.contains("/stats") || command.contains("/health");
        if probes_tower && self.counters.is_down() {
            return ExecOutput {
                exit_code: 7,
                output: "curl: (7) Failed to connect".to_string(),
            };
        }
        if command.contains("/stats") {
            let output = serde_json::to_string(&self.counters.stats()).unwrap_or_default();
            return ExecOutput {
                exit_code: 0,
                output,
            };
        }
        if command.contains("/health") {
            return ExecOutput {
                exit_code: 0,
                output: r#"{"status":"ok"}"#.to_string(),
            };
        }
        if command.contains("/hello") {
            let agent_id = agent_header(command).unwrap_or("unknown");
            let (count, total) = self.counters.hit(agent_id);
            return ExecOutput {
                exit_code: 0,
                output: json!({
                    "message": "Hello from Tower!",
                    "agentId": agent_id,
                    "requestNumber": count,
                    "totalRequests": total,
                })
                .to_string(),
            };
        }
        ExecOutput {
            exit_code: 0,
            output: String::new(),
        }
    }
}

/// Value of an `X-Agent-ID:` header in a curl command line.
fn agent_header(command: &str) -> Option<&str> {
    let start = command.find("X-Agent-ID:")? + "X-Agent-ID:".len();
    command[start..]
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .next()
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> SandboxResult<ExecOutput> {
        if self.is_destroyed() {
            return Err(SandboxError::Exec {
                sandbox_id: self.id.clone(),
                reason: "sandbox destroyed".to_string(),
            });
        }
        lock(&self.commands).push(command.to_string());
        if options.background {
            lock(&self.detached).push(command.to_string());
            return Ok(ExecOutput {
                exit_code: 0,
                output: String::new(),
            });
        }
        Ok(self.respond(command))
    }

    async fn network_address(&self, port: u16) -> SandboxResult<NetworkAddress> {
        Ok(NetworkAddress {
            host: self.host.clone(),
            port,
        })
    }

    async fn destroy(&self) -> SandboxResult<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(SandboxError::Destroy {
                sandbox_id: self.id.clone(),
                reason: "provider refused".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Provisions [`FakeSandbox`]es and remembers every one it created.
///
/// The target is recognised by its exposed port; agent sandboxes by their
/// `agent-<id>-` label prefix.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    counters: Arc<TowerCounters>,
    fail_target: AtomicBool,
    fail_destroy: AtomicBool,
    failing_agents: Mutex<HashSet<String>>,
    created: Mutex<Vec<Arc<FakeSandbox>>>,
    next_id: AtomicU32,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<TowerCounters> {
        self.counters.clone()
    }

    pub fn fail_target(&self) {
        self.fail_target.store(true, Ordering::SeqCst);
    }

    pub fn fail_agent(&self, agent_id: &str) {
        lock(&self.failing_agents).insert(agent_id.to_string());
    }

    /// Sandboxes created from now on fail their destroy call.
    pub fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeSandbox>> {
        lock(&self.created).clone()
    }

    pub fn target_count(&self) -> usize {
        self.created()
            .iter()
            .filter(|s| s.role == SandboxRole::Target)
            .count()
    }

    pub fn agent_count(&self) -> usize {
        self.created()
            .iter()
            .filter(|s| s.role == SandboxRole::Agent)
            .count()
    }

    pub fn live_count(&self) -> usize {
        self.created().iter().filter(|s| !s.is_destroyed()).count()
    }

    fn agent_failing(&self, label: &str) -> bool {
        lock(&self.failing_agents)
            .iter()
            .any(|id| label.starts_with(&format!("agent-{id}-")))
    }
}

#[async_trait]
impl SandboxProvisioner for FakeProvisioner {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<Arc<dyn Sandbox>> {
        let role = if spec.exposed_port.is_some() {
            SandboxRole::Target
        } else {
            SandboxRole::Agent
        };
        let refused = match role {
            SandboxRole::Target => self.fail_target.load(Ordering::SeqCst),
            SandboxRole::Agent => self.agent_failing(&spec.label),
        };
        if refused {
            return Err(SandboxError::Provision(format!(
                "{}: capacity exhausted",
                spec.label
            )));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let sandbox = Arc::new(FakeSandbox {
            id: format!("fake-{n}"),
            host: format!("100.64.0.{n}"),
            role,
            label: spec.label,
            counters: self.counters.clone(),
            commands: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            fail_destroy: self.fail_destroy.load(Ordering::SeqCst),
        });
        lock(&self.created).push(sandbox.clone());
        Ok(sandbox)
    }
}

// ---------------------------------------------------------------------------
// Reasoning provider
// ---------------------------------------------------------------------------

/// What a [`ScriptedProvider`] was asked.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub system_prompt: String,
    pub history: Vec<Turn>,
}

/// Replays queued steps, then repeats a fallback step forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderResult<ReasoningStep>>>,
    fallback: ReasoningStep,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    /// Once `script` is exhausted the provider keeps answering `fallback`.
    pub fn new(script: Vec<ProviderResult<ReasoningStep>>, fallback: ReasoningStep) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::from_millis(10),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer `step`.
    pub fn repeating(step: ReasoningStep) -> Self {
        Self::new(Vec::new(), step)
    }

    /// Simulated latency of each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    async fn step(&self, request: &StepRequest<'_>) -> ProviderResult<ReasoningStep> {
        tokio::time::sleep(self.delay).await;
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(RecordedRequest {
            model: request.model.to_string(),
            system_prompt: request.system_prompt.to_string(),
            history: request.history.to_vec(),
        });

        let next = lock(&self.script).pop_front();
        match next {
            Some(Ok(mut step)) => {
                for call in &mut step.tool_calls {
                    call.id = format!("{}-{n}", call.id);
                }
                Ok(step)
            }
            Some(Err(e)) => Err(e),
            None => {
                let mut step = self.fallback.clone();
                for call in &mut step.tool_calls {
                    call.id = format!("{}-{n}", call.id);
                }
                Ok(step)
            }
        }
    }
}

const STEP_USAGE: Usage = Usage {
    input_tokens: 10,
    output_tokens: 5,
};

/// A step that calls `execute_bash` with `command`.
pub fn bash_step(command: &str) -> ReasoningStep {
    ReasoningStep {
        text: None,
        tool_calls: vec![ToolCall {
            id: "call".to_string(),
            name: BASH_TOOL_NAME.to_string(),
            arguments: json!({ "command": command }),
        }],
        usage: STEP_USAGE,
        finish_reason: FinishReason::ToolUse,
    }
}

/// A step that calls `execute_bash` with `background: true`.
pub fn background_bash_step(command: &str) -> ReasoningStep {
    let mut step = bash_step(command);
    step.tool_calls[0].arguments["background"] = json!(true);
    step
}

/// A step with text only: no tool call, finished.
pub fn text_step(text: &str) -> ReasoningStep {
    ReasoningStep {
        text: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: STEP_USAGE,
        finish_reason: FinishReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_header_parsing() {
        assert_eq!(
            agent_header(r#"curl --socks5 localhost:1055 -H "X-Agent-ID: agent-2" http://x:3000/hello"#),
            Some("agent-2")
        );
        assert_eq!(
            agent_header("curl -H 'X-Agent-ID:agent-3' http://x/hello"),
            Some("agent-3")
        );
        assert_eq!(agent_header("curl http://x/hello"), None);
    }

    #[tokio::test]
    async fn test_fake_sandbox_counts_hello() {
        let provisioner = FakeProvisioner::new();
        let sandbox = provisioner
            .create(SandboxSpec {
                label: "agent-agent-1-r".into(),
                vcpus: 1,
                timeout: Duration::from_secs(60),
                exposed_port: None,
                runtime: None,
            })
            .await
            .unwrap();

        let cmd = r#"curl -H "X-Agent-ID: agent-1" http://100.64.0.9:3000/hello"#;
        sandbox.exec(cmd, ExecOptions::default()).await.unwrap();
        let out = sandbox.exec(cmd, ExecOptions::default()).await.unwrap();
        assert!(out.output.contains("\"requestNumber\":2"));

        let stats = provisioner.counters().stats();
        assert_eq!(stats.damage_for("agent-1"), 2);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(provisioner.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_agent_is_refused() {
        let provisioner = FakeProvisioner::new();
        provisioner.fail_agent("agent-2");
        let err = provisioner
            .create(SandboxSpec {
                label: "agent-agent-2-r".into(),
                vcpus: 1,
                timeout: Duration::from_secs(60),
                exposed_port: None,
                runtime: None,
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Provision(_)));
        assert!(provisioner.created().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_provider_falls_back() {
        let provider = ScriptedProvider::new(vec![Ok(bash_step("ls"))], text_step("idle"))
            .with_delay(Duration::ZERO);
        let tool = crate::reasoning::bash_tool();
        let req = StepRequest {
            model: "m",
            system_prompt: "s",
            history: &[],
            tool: &tool,
            max_tokens: 16,
        };
        let first = provider.step(&req).await.unwrap();
        let second = provider.step(&req).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(second.text.as_deref(), Some("idle"));
        assert_eq!(provider.calls(), 2);
    }
}
