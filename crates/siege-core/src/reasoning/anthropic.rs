//! Anthropic messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ProviderError, ProviderResult};
use super::{
    http_client, FinishReason, ReasoningProvider, ReasoningStep, StepRequest, ToolCall, Turn,
    Usage,
};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, ANTHROPIC_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }
}

/// Map the history to messages. Consecutive tool results collapse into one
/// user message, since the API requires user and assistant turns to alternate.
fn messages_json(history: &[Turn]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(history.len());
    let mut pending_results: Vec<Value> = Vec::new();

    for turn in history {
        if let Turn::ToolResult { call_id, content } = turn {
            pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
            }));
            continue;
        }
        if !pending_results.is_empty() {
            messages.push(json!({
                "role": "user",
                "content": std::mem::take(&mut pending_results),
            }));
        }
        match turn {
            Turn::User(content) => messages.push(json!({ "role": "user", "content": content })),
            Turn::Assistant { text, tool_calls } => {
                let mut blocks = Vec::new();
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "(no response)" }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Turn::ToolResult { .. } => {}
        }
    }

    if !pending_results.is_empty() {
        messages.push(json!({ "role": "user", "content": pending_results }));
    }
    messages
}

/// Messages API request body for one step.
pub fn request_body(request: &StepRequest<'_>) -> Value {
    json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "system": request.system_prompt,
        "messages": messages_json(request.history),
        "tools": [{
            "name": request.tool.name,
            "description": request.tool.description,
            "input_schema": request.tool.parameters,
        }],
    })
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ApiBlock>,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Decode a messages API response body.
pub fn parse_response(body: Value) -> ProviderResult<ReasoningStep> {
    let response: ApiResponse =
        serde_json::from_value(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ApiBlock::Text { text } => texts.push(text),
            ApiBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ApiBlock::Unknown => {}
        }
    }
    let text = texts.join("\n");

    let finish_reason = match response.stop_reason.as_deref() {
        None | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolUse,
        Some("max_tokens") => FinishReason::Length,
        Some(other) => FinishReason::Other(other.to_string()),
    };

    Ok(ReasoningStep {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: response
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default(),
        finish_reason,
    })
}

#[async_trait]
impl ReasoningProvider for AnthropicProvider {
    async fn step(&self, request: &StepRequest<'_>) -> ProviderResult<ReasoningStep> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_response(body)
    }
}
