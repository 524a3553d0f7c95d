//! [`ModelClient`] over Ollama's `/api/chat` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::http::send_with_retry;
use super::model::{ChatMessage, ModelClient, ModelError, ModelRequest, ModelResponse, Role};
use crate::tools::{ToolCall, ToolDefinition};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen3";

/// Local models can take a while to load on the first call.
const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    options: ChatOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: WireMessage,
    #[serde(default)]
    eval_count: u32,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone().into_value(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            tool_calls,
            tool_name: message.tool_name.clone(),
        }
    }
}

/// Ollama chat model with native tool calling.
#[derive(Clone)]
pub struct OllamaChatModel {
    endpoint: Url,
    model: String,
    temperature: f32,
    client: Client,
}

impl OllamaChatModel {
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self, ModelError> {
        let invalid = |reason: String| ModelError::InvalidEndpoint {
            url: base_url.to_string(),
            reason,
        };
        let mut base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("api/chat").map_err(|e| invalid(e.to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            endpoint,
            model: model.into(),
            temperature: 0.0,
            client,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_body<'a>(&'a self, request: &'a ModelRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
            },
            tools: request
                .tools
                .iter()
                .map(|function| WireTool {
                    tool_type: "function",
                    function,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ModelClient for OllamaChatModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = self.request_body(request);
        debug!(
            "POST {} ({} message(s), {} tool(s))",
            self.endpoint,
            request.messages.len(),
            request.tools.len()
        );

        let response =
            send_with_retry(|| self.client.post(self.endpoint.clone()).json(&body)).await?;
        let text = response.text().await?;
        parse_chat_response(&text, &request.tools)
    }
}

fn parse_chat_response(text: &str, offered: &[ToolDefinition]) -> Result<ModelResponse, ModelError> {
    if text.trim().is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    let response: ChatResponse = serde_json::from_str(text)?;
    debug!("Model replied ({} eval tokens)", response.eval_count);

    let message = response.message;
    if message.role != Role::Assistant.as_str() {
        debug!("Unexpected role in model reply: {}", message.role);
    }

    let mut tool_calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall::new(call.function.name, call.function.arguments))
        .collect();
    if tool_calls.is_empty() && !offered.is_empty() {
        tool_calls = parse_tool_calls_from_text(&message.content, offered);
    }

    Ok(ModelResponse {
        content: message.content,
        tool_calls,
    })
}

/// Recover tool calls that a model wrote into its text as JSON objects of
/// the form `{"name": ..., "arguments": {...}}`. Only names of offered tools
/// are accepted.
fn parse_tool_calls_from_text(content: &str, offered: &[ToolDefinition]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(call) = try_parse_tool_call(&content[s..=i], offered) {
                            calls.push(call);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if !calls.is_empty() {
        debug!("Recovered {} tool call(s) from model text", calls.len());
    }
    calls
}

fn try_parse_tool_call(json: &str, offered: &[ToolDefinition]) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(json).ok()?;
    let name = value.get("name")?.as_str()?;
    if !offered.iter().any(|t| t.name == name) {
        return None;
    }
    // Some models say "parameters" instead of "arguments"
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(ToolCall::new(name, arguments))
}
