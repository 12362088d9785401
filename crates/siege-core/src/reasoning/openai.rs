//! OpenAI-compatible chat-completions provider.
//!
//! Serves OpenAI itself plus the vendors that expose the same wire format
//! (xAI, Google's OpenAI endpoint).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ProviderError, ProviderResult};
use super::{
    http_client, FinishReason, ReasoningProvider, ReasoningStep, StepRequest, ToolSpec, ToolCall,
    Turn, Usage,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/";

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: String, base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key,
            base_url: base_url.into(),
        }
    }

    pub fn openai(api_key: String) -> Self {
        Self::new(api_key, OPENAI_BASE_URL)
    }

    pub fn xai(api_key: String) -> Self {
        Self::new(api_key, XAI_BASE_URL)
    }

    pub fn google(api_key: String) -> Self {
        Self::new(api_key, GOOGLE_BASE_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn tool_json(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn message_json(turn: &Turn) -> Value {
    match turn {
        Turn::User(content) => json!({ "role": "user", "content": content }),
        Turn::Assistant { text, tool_calls } => {
            let mut message = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                message["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            message
        }
        Turn::ToolResult { call_id, content } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content,
        }),
    }
}

/// Chat-completions request body for one step.
pub fn request_body(request: &StepRequest<'_>) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system_prompt })];
    messages.extend(request.history.iter().map(message_json));

    json!({
        "model": request.model,
        "messages": messages,
        "tools": [tool_json(request.tool)],
        "tool_choice": "auto",
        "max_tokens": request.max_tokens,
    })
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Decode a chat-completions response body.
pub fn parse_response(body: Value) -> ProviderResult<ReasoningStep> {
    let response: ApiResponse =
        serde_json::from_value(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            // Models occasionally emit invalid JSON; keep the raw text so the
            // runner can report it back.
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments)),
        })
        .collect();

    let finish_reason = match choice.finish_reason.as_deref() {
        None | Some("stop") => FinishReason::Stop,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("length") => FinishReason::Length,
        Some(other) => FinishReason::Other(other.to_string()),
    };

    Ok(ReasoningStep {
        text: choice.message.content.filter(|t| !t.is_empty()),
        tool_calls,
        usage: response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
        finish_reason,
    })
}

#[async_trait]
impl ReasoningProvider for OpenAiCompatProvider {
    async fn step(&self, request: &StepRequest<'_>) -> ProviderResult<ReasoningStep> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::bash_tool;

    #[test]
    fn test_request_body_maps_history() {
        let tool = bash_tool();
        let history = vec![
            Turn::Assistant {
                text: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "execute_bash".into(),
                    arguments: json!({"command": "nmap 100.64.0.1"}),
                }],
            },
            Turn::ToolResult {
                call_id: "call_1".into(),
                content: "Exit code: 0\nOutput:\n3000/tcp open".into(),
            },
            Turn::User("Continue attacking the tower.".into()),
        ];
        let body = request_body(&StepRequest {
            model: "gpt-4o",
            system_prompt: "You are an agent",
            history: &history,
            tool: &tool,
            max_tokens: 4096,
        });

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            r#"{"command":"nmap 100.64.0.1"}"#
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "execute_bash");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let step = parse_response(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Scanning first.",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "execute_bash", "arguments": "{\"command\":\"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 15, "total_tokens": 135}
        }))
        .unwrap();

        assert_eq!(step.text.as_deref(), Some("Scanning first."));
        assert_eq!(step.tool_calls[0].arguments["command"], "ls");
        assert_eq!(step.finish_reason, FinishReason::ToolUse);
        assert_eq!(step.usage.total(), 135);
    }

    #[test]
    fn test_parse_keeps_invalid_arguments_raw() {
        let step = parse_response(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c", "function": {"name": "execute_bash", "arguments": "{oops"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        assert_eq!(step.tool_calls[0].arguments, Value::String("{oops".into()));
        assert!(step.text.is_none());
        assert_eq!(step.usage, Usage::default());
    }

    #[test]
    fn test_parse_rejects_empty_choices() {
        let err = parse_response(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[test]
    fn test_endpoint_joins_trailing_slash() {
        let google = OpenAiCompatProvider::google("k".into());
        assert_eq!(
            google.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
        let xai = OpenAiCompatProvider::xai("k".into());
        assert_eq!(xai.endpoint(), "https://api.x.ai/v1/chat/completions");
    }
}
