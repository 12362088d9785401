//! Agent reasoning loop against scripted providers and fake sandboxes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use siege_core::fakes::{background_bash_step, bash_step, text_step, FakeProvisioner, ScriptedProvider};
use siege_core::{
    AgentOutcome, AgentRunner, BattleConfig, DirectOverlay, EventBus, LedgerSink, LocalProvisioner,
    ProviderError, ProviderRegistry, RunEmitter, SandboxLifecycleManager, TeardownReport, Turn,
    CONTINUE_NUDGE,
};
use siege_state::fakes::MemoryLedger;
use siege_state::{AgentProfile, BattleEvent, EventKind, EventLog, ProviderKind, RunId, RunStore};

struct Harness {
    ledger: Arc<MemoryLedger>,
    provisioner: Arc<FakeProvisioner>,
    sandboxes: Arc<SandboxLifecycleManager>,
    emitter: RunEmitter,
    run_id: RunId,
    config: BattleConfig,
}

async fn harness() -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let sink = Arc::new(LedgerSink::new(ledger.clone(), EventBus::new()));
    let provisioner = Arc::new(FakeProvisioner::new());
    let config = BattleConfig::default();
    let sandboxes = Arc::new(SandboxLifecycleManager::new(
        provisioner.clone(),
        Arc::new(DirectOverlay),
        config.clone(),
    ));
    let run_id = ledger.create_run(vec![]).await.unwrap().run_id;
    sandboxes
        .create_agent_sandbox(&run_id, "agent-1")
        .await
        .unwrap();
    let emitter = RunEmitter::new(run_id.clone(), sink);
    Harness {
        ledger,
        provisioner,
        sandboxes,
        emitter,
        run_id,
        config,
    }
}

fn openai_agent() -> AgentProfile {
    AgentProfile {
        id: "agent-1".to_string(),
        name: "GPT-4".to_string(),
        provider: ProviderKind::Openai,
        model: "gpt-4o".to_string(),
        color: "#10a37f".to_string(),
    }
}

impl Harness {
    /// Run the agent for `duration` of (virtual) time, then cancel it.
    async fn run_for(&self, registry: ProviderRegistry, duration: Duration) -> AgentOutcome {
        let cancel = CancellationToken::new();
        let runner = AgentRunner::new(
            openai_agent(),
            Arc::new(registry),
            self.sandboxes.clone(),
            "100.64.0.9".to_string(),
            self.emitter.clone(),
            self.config.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(runner.run());
        tokio::time::sleep(duration).await;
        cancel.cancel();
        task.await.unwrap()
    }

    async fn events(&self) -> Vec<BattleEvent> {
        self.ledger.list_since(&self.run_id, 0).await.unwrap()
    }

    fn agent_commands(&self) -> Vec<String> {
        self.provisioner.created()[0].commands()
    }
}

fn with_openai(provider: Arc<ScriptedProvider>) -> ProviderRegistry {
    ProviderRegistry::empty().with_provider(ProviderKind::Openai, provider)
}

fn payload_of(events: &[BattleEvent], kind: EventKind) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter(|e| e.kind == kind)
        .filter_map(|e| e.payload.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_tool_result_is_fed_back() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::new(
        vec![Ok(bash_step(
            r#"curl -s --socks5 localhost:1055 -H "X-Agent-ID: agent-1" http://100.64.0.9:3000/hello"#,
        ))],
        text_step("done"),
    ));

    h.run_for(with_openai(provider.clone()), Duration::from_millis(100))
        .await;

    let requests = provider.requests();
    assert!(requests.len() >= 2);
    assert_eq!(requests[0].model, "gpt-4o");
    assert!(requests[0].system_prompt.contains("IP: 100.64.0.9"));
    assert!(requests[0].history.is_empty());

    let history = &requests[1].history;
    assert_eq!(history.len(), 2);
    assert!(matches!(&history[0], Turn::Assistant { tool_calls, .. } if tool_calls.len() == 1));
    let Turn::ToolResult { call_id, content } = &history[1] else {
        panic!("expected a tool result, got {:?}", history[1]);
    };
    assert_eq!(call_id, "call-0");
    assert!(content.starts_with("Exit code: 0\nOutput:\n"));
    assert!(content.contains(r#""requestNumber":1"#));

    assert_eq!(h.provisioner.counters().stats().agents["agent-1"], 1);
    let events = h.events().await;
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::AgentLog && e.message.as_deref().unwrap_or("").starts_with("$ curl")));
}

#[tokio::test(start_paused = true)]
async fn test_text_only_step_gets_a_nudge() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::repeating(text_step("Let me think.")));

    h.run_for(with_openai(provider.clone()), Duration::from_millis(35))
        .await;

    let requests = provider.requests();
    let history = &requests[1].history;
    assert_eq!(
        history[0],
        Turn::Assistant {
            text: Some("Let me think.".to_string()),
            tool_calls: vec![],
        }
    );
    assert_eq!(history[1], Turn::User(CONTINUE_NUDGE.to_string()));

    let events = h.events().await;
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::AgentThinking && e.message.as_deref() == Some("Let me think.")));
}

#[tokio::test(start_paused = true)]
async fn test_provider_error_waits_then_retries() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::new(
        vec![Err(ProviderError::Api {
            status: 529,
            body: "overloaded".to_string(),
        })],
        text_step("back"),
    ));

    // One failed call, then nothing until the retry delay has passed.
    let outcome = h
        .run_for(with_openai(provider.clone()), Duration::from_millis(1500))
        .await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(outcome.steps, 0);

    let events = h.events().await;
    let error_log = events
        .iter()
        .find(|e| e.kind == EventKind::AgentLog && e.message.as_deref().unwrap_or("").starts_with("LLM Error:"))
        .unwrap();
    assert!(error_log.message.as_deref().unwrap().contains("overloaded"));
}

#[tokio::test(start_paused = true)]
async fn test_provider_error_does_not_end_the_loop() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::new(
        vec![Err(ProviderError::Decode("truncated".to_string()))],
        text_step("back"),
    ));

    let outcome = h
        .run_for(with_openai(provider.clone()), Duration::from_millis(2100))
        .await;
    assert!(provider.calls() >= 2);
    assert!(outcome.steps >= 1);
    // The failed call left no trace in the history.
    assert!(provider.requests()[1].history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials_finishes_immediately() {
    let h = harness().await;
    let registry = ProviderRegistry::from_lookup(|_| None);

    let outcome = h.run_for(registry, Duration::from_millis(10)).await;
    assert_eq!(outcome.steps, 0);
    assert_eq!(outcome.usage.total(), 0);

    let events = h.events().await;
    let statuses: Vec<String> = payload_of(&events, EventKind::AgentStatus)
        .iter()
        .map(|p| p["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["starting", "finished"]);
    let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
    assert_eq!(error.agent_id.as_deref(), Some("agent-1"));
    assert!(error.message.as_deref().unwrap().contains("OPENAI_API_KEY"));
}

#[tokio::test(start_paused = true)]
async fn test_background_command_is_detached() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::new(
        vec![Ok(background_bash_step("python3 -m http.server 8080"))],
        text_step("waiting"),
    ));

    h.run_for(with_openai(provider.clone()), Duration::from_millis(30))
        .await;

    let sandbox = &h.provisioner.created()[0];
    assert_eq!(sandbox.commands()[0], "python3 -m http.server 8080");
    assert_eq!(
        sandbox.detached_commands(),
        vec!["python3 -m http.server 8080".to_string()]
    );
    let Turn::ToolResult { content, .. } = &provider.requests()[1].history[1] else {
        panic!("expected a tool result");
    };
    assert_eq!(
        content,
        "Exit code: 0\nOutput:\nCommand started in background"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_is_reported_to_the_model() {
    let h = harness().await;
    let mut step = bash_step("ls");
    step.tool_calls[0].name = "read_file".to_string();
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(step)], text_step("ok")));

    h.run_for(with_openai(provider.clone()), Duration::from_millis(30))
        .await;

    assert!(h.agent_commands().is_empty());
    let Turn::ToolResult { content, .. } = &provider.requests()[1].history[1] else {
        panic!("expected a tool result");
    };
    assert!(content.contains("unknown tool read_file"));
}

#[tokio::test(start_paused = true)]
async fn test_token_usage_is_cumulative() {
    let h = harness().await;
    let provider = Arc::new(ScriptedProvider::repeating(text_step("hmm")));

    let outcome = h
        .run_for(with_openai(provider.clone()), Duration::from_millis(35))
        .await;
    assert_eq!(outcome.steps, 3);
    assert_eq!(outcome.usage.total(), 45);

    let events = h.events().await;
    let totals: Vec<u64> = payload_of(&events, EventKind::AgentTokens)
        .iter()
        .map(|p| p["totalTokens"].as_u64().unwrap())
        .collect();
    assert_eq!(totals, vec![15, 30, 45]);

    let summary = events
        .iter()
        .rev()
        .find(|e| e.kind == EventKind::AgentLog)
        .unwrap();
    assert_eq!(
        summary.message.as_deref(),
        Some("GPT-4 finished after 3 steps, 45 tokens used")
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_a_slow_step() {
    let h = harness().await;
    let provider = Arc::new(
        ScriptedProvider::repeating(text_step("slow")).with_delay(Duration::from_secs(60)),
    );

    let started = tokio::time::Instant::now();
    let outcome = h
        .run_for(with_openai(provider.clone()), Duration::from_millis(100))
        .await;
    assert_eq!(outcome.steps, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Whether `pid` is alive and not a zombie.
#[cfg(target_os = "linux")]
fn process_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_background_processes_do_not_outlive_teardown() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = scratch.path().join("pid");

    let ledger = Arc::new(MemoryLedger::new());
    let sink = Arc::new(LedgerSink::new(ledger.clone(), EventBus::new()));
    let config = BattleConfig::default();
    let sandboxes = Arc::new(SandboxLifecycleManager::new(
        Arc::new(LocalProvisioner::in_dir(root.path())),
        Arc::new(DirectOverlay),
        config.clone(),
    ));
    let run_id = ledger.create_run(vec![]).await.unwrap().run_id;
    sandboxes
        .create_agent_sandbox(&run_id, "agent-1")
        .await
        .unwrap();

    let provider = Arc::new(
        ScriptedProvider::new(
            vec![Ok(background_bash_step(&format!(
                "echo $$ > {}; exec sleep 4243",
                pid_file.display()
            )))],
            text_step("waiting"),
        )
        .with_delay(Duration::from_millis(20)),
    );
    let cancel = CancellationToken::new();
    let runner = AgentRunner::new(
        openai_agent(),
        Arc::new(with_openai(provider)),
        sandboxes.clone(),
        "127.0.0.1".to_string(),
        RunEmitter::new(run_id.clone(), sink),
        config,
        cancel.clone(),
    );
    let task = tokio::spawn(runner.run());

    let mut pid = String::new();
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&pid_file) {
            if !contents.trim().is_empty() {
                pid = contents.trim().to_string();
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!pid.is_empty(), "background command never started");
    assert!(process_alive(&pid));

    cancel.cancel();
    task.await.unwrap();
    let report = sandboxes.destroy_all(&run_id).await;
    assert_eq!(
        report,
        TeardownReport {
            destroyed: 1,
            failed: 0
        }
    );

    let mut survived = true;
    for _ in 0..20 {
        if !process_alive(&pid) {
            survived = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!survived, "background process {pid} survived destroy_all");
}
