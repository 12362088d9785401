//! Agent runner: one reasoning loop per agent.
//!
//! Each iteration asks the agent's provider for a step, executes the
//! `execute_bash` calls it requests inside the agent's sandbox, and feeds the
//! results back as tool turns. The loop ends when the run's token is
//! cancelled; provider errors only delay the next attempt.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use siege_state::{AgentProfile, EventKind, NewEvent};

use crate::config::BattleConfig;
use crate::events::RunEmitter;
use crate::metrics::METRICS;
use crate::reasoning::{
    bash_tool, ProviderRegistry, ReasoningProvider, StepRequest, ToolCall, Turn, Usage,
    BASH_TOOL_NAME,
};
use crate::sandbox::{ExecOptions, SandboxKey, SandboxLifecycleManager};

pub const CONTINUE_NUDGE: &str =
    "Continue attacking the tower. Use the execute_bash tool to make more requests.";

/// Mission briefing for an agent.
pub fn system_prompt(tower_address: &str, agent_id: &str) -> String {
    format!(
        "You are an AI agent in a battle arena. Your goal is to defeat the tower server.

MISSION:
- You have access to a remote server at IP: {tower_address}
- You must discover what port is open and what endpoint to call
- Use the execute_bash tool to run commands in your sandbox
- Your agent ID is: {agent_id}

HINTS:
- Start by scanning the server to find open ports
- Try to discover what endpoints are available
- When making HTTP requests, use: curl --socks5 localhost:1055 <url>
- Include your agent ID in requests using the X-Agent-ID header

WIN CONDITION:
- Call the correct endpoint enough times to deplete the tower's health
- Each successful request does damage to the tower

Be efficient and strategic. Good luck!"
    )
}

/// Keep the last `max_chars` characters, marking the cut with `...`.
pub fn tail_output(output: &str, max_chars: usize) -> String {
    if output.is_empty() {
        return "(no output)".to_string();
    }
    let len = output.chars().count();
    if len <= max_chars {
        return output.to_string();
    }
    let tail: String = output.chars().skip(len - max_chars).collect();
    format!("...{tail}")
}

/// What an agent accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub usage: Usage,
    /// Reasoning steps that returned successfully
    pub steps: u64,
}

pub struct AgentRunner {
    agent: AgentProfile,
    providers: Arc<ProviderRegistry>,
    sandboxes: Arc<SandboxLifecycleManager>,
    tower_address: String,
    emitter: RunEmitter,
    config: BattleConfig,
    cancel: CancellationToken,
}

impl AgentRunner {
    pub fn new(
        agent: AgentProfile,
        providers: Arc<ProviderRegistry>,
        sandboxes: Arc<SandboxLifecycleManager>,
        tower_address: String,
        emitter: RunEmitter,
        config: BattleConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            providers,
            sandboxes,
            tower_address,
            emitter,
            config,
            cancel,
        }
    }

    pub async fn run(self) -> AgentOutcome {
        let agent_id = self.agent.id.clone();
        let mut outcome = AgentOutcome {
            agent_id: agent_id.clone(),
            ..AgentOutcome::default()
        };

        self.emitter.agent_status(&agent_id, "starting").await;
        let provider = match self.providers.resolve(self.agent.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "agent has no reasoning provider");
                self.emitter.error(Some(&agent_id), e.to_string()).await;
                self.emitter.agent_status(&agent_id, "finished").await;
                return outcome;
            }
        };
        self.emitter
            .agent_log(
                &agent_id,
                format!("Starting {} ({})...", self.agent.name, self.agent.model),
            )
            .await;
        self.emitter.agent_status(&agent_id, "running").await;

        self.reason(provider.as_ref(), &mut outcome).await;

        self.emitter.agent_status(&agent_id, "finished").await;
        self.emitter
            .agent_log(
                &agent_id,
                format!(
                    "{} finished after {} steps, {} tokens used",
                    self.agent.name,
                    outcome.steps,
                    outcome.usage.total()
                ),
            )
            .await;
        outcome
    }

    async fn reason(&self, provider: &dyn ReasoningProvider, outcome: &mut AgentOutcome) {
        let agent_id = self.agent.id.as_str();
        let prompt = system_prompt(&self.tower_address, agent_id);
        let tool = bash_tool();
        let mut history: Vec<Turn> = Vec::new();

        while !self.cancel.is_cancelled() {
            let request = StepRequest {
                model: &self.agent.model,
                system_prompt: &prompt,
                history: &history,
                tool: &tool,
                max_tokens: self.config.max_tokens,
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = provider.step(&request) => result,
            };

            let step = match result {
                Ok(step) => step,
                Err(e) => {
                    METRICS.inc_provider_errors();
                    debug!(agent_id = %agent_id, error = %e, "reasoning step failed");
                    self.emitter
                        .agent_log(agent_id, format!("LLM Error: {e}"))
                        .await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.provider_retry_delay) => continue,
                    }
                }
            };

            outcome.steps += 1;
            outcome.usage += step.usage;
            self.emitter
                .emit(
                    NewEvent::new(EventKind::AgentTokens)
                        .agent(agent_id)
                        .payload(json!({
                            "inputTokens": outcome.usage.input_tokens,
                            "outputTokens": outcome.usage.output_tokens,
                            "totalTokens": outcome.usage.total(),
                        })),
                )
                .await;

            if let Some(text) = step.text.as_deref().filter(|t| !t.trim().is_empty()) {
                self.emitter.agent_thinking(agent_id, text).await;
            }

            history.push(Turn::Assistant {
                text: step.text.clone(),
                tool_calls: step.tool_calls.clone(),
            });

            if step.tool_calls.is_empty() {
                history.push(Turn::User(CONTINUE_NUDGE.to_string()));
                continue;
            }

            for call in &step.tool_calls {
                let content = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    content = self.run_tool(call) => content,
                };
                history.push(Turn::ToolResult {
                    call_id: call.id.clone(),
                    content,
                });
            }
        }
    }

    /// Execute one tool call and return the tool-result turn content.
    async fn run_tool(&self, call: &ToolCall) -> String {
        let agent_id = self.agent.id.as_str();
        if call.name != BASH_TOOL_NAME {
            return format!("Error: unknown tool {}", call.name);
        }
        let Some(command) = call.arguments.get("command").and_then(|c| c.as_str()) else {
            return "Error: missing required argument \"command\"".to_string();
        };
        let background = call
            .arguments
            .get("background")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);

        self.emitter.agent_log(agent_id, format!("$ {command}")).await;

        let key = SandboxKey::agent(self.emitter.run_id(), agent_id);
        let (exit_code, output) = if background {
            match self
                .sandboxes
                .exec(&key, command, ExecOptions::background())
                .await
            {
                Ok(_) => (0, "Command started in background".to_string()),
                Err(e) => (1, format!("Error: {e}")),
            }
        } else {
            match self.sandboxes.exec(&key, command, ExecOptions::default()).await {
                Ok(out) => (
                    out.exit_code,
                    tail_output(&out.output, self.config.output_tail_chars),
                ),
                Err(e) => (1, format!("Error: {e}")),
            }
        };

        self.emitter.agent_log(agent_id, output.clone()).await;
        format!("Exit code: {exit_code}\nOutput:\n{output}")
    }
}
