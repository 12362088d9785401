//! Reasoning providers: the external systems that decide an agent's next move.
//!
//! A provider takes the system prompt, the conversation so far, and the one
//! declared tool, and returns optional text, zero or more tool calls, token
//! usage, and why it stopped.

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod registry;

use std::ops::AddAssign;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, ProviderResult};
pub use openai::OpenAiCompatProvider;
pub use registry::ProviderRegistry;

/// Name of the single tool agents may call.
pub const BASH_TOOL_NAME: &str = "execute_bash";

/// A tool declaration in provider-neutral form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

/// The `execute_bash { command, background? }` tool.
pub fn bash_tool() -> ToolSpec {
    ToolSpec {
        name: BASH_TOOL_NAME.to_string(),
        description: "Execute a bash command in your sandbox environment. \
You have access to common tools like curl, nmap, nc, etc. \
Use --socks5 localhost:1055 with curl to route traffic through the overlay network. \
Returns the command output (truncated to the last 500 chars if longer)."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "background": {
                    "type": "boolean",
                    "description": "Run the command in background (default: false)"
                }
            },
            "required": ["command"]
        }),
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back in the tool result
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Turn {
    User(String),
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

/// Token counters for one or more steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other(String),
}

/// Input to one reasoning step.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub history: &'a [Turn],
    pub tool: &'a ToolSpec,
    pub max_tokens: u32,
}

/// Output of one reasoning step.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningStep {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// A language-model backend.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn step(&self, request: &StepRequest<'_>) -> ProviderResult<ReasoningStep>;
}

/// Build the HTTP client shared by the providers.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
