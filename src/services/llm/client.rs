//! LLM HTTP client for OpenAI-compatible chat-completion APIs.
//!
//! Two call shapes: `complete_json` (structured-JSON-mode, used by C5/C6) and
//! `complete_with_tools` (multi-turn tool-calling transcript, used by C8).
//! Retries on 429/5xx/timeout follow each caller's own backoff policy -- this
//! client makes exactly one HTTP attempt per call.

use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm response parse error: {0}: {1}")]
    Parse(String, String),
    #[error("llm request timed out after {0}s")]
    Timeout(u64),
    #[error("llm rate limited, retry after {0}s")]
    RateLimited(u64),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::Api(_))
    }
}

#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: i32,
    pub temperature: f64,
}

pub struct LlmClient {
    http: Client,
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient {
    pub fn new() -> Self {
        Self { http: Client::builder().build().expect("failed to build reqwest client") }
    }

    /// Structured-JSON-mode completion: one system prompt, one user payload,
    /// response parsed as `Resp`. Used by unit normalization, analyte
    /// mapping, subject/body classification.
    pub async fn complete_json<Req, Resp>(
        &self,
        endpoint: &LlmEndpoint,
        system_prompt: &str,
        request: &Req,
    ) -> Result<Resp, LlmError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let user_prompt =
            serde_json::to_string_pretty(request).map_err(|e| LlmError::Api(e.to_string()))?;

        let body = ChatCompletionRequest {
            model: endpoint.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(&user_prompt),
            ],
            max_tokens: Some(endpoint.max_tokens as u32),
            temperature: Some(endpoint.temperature),
            response_format: Some(ResponseFormat { r#type: "json_object".to_string() }),
            tools: None,
            tool_choice: None,
        };

        let response = self.post_chat(endpoint, &body).await?;
        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Parse("empty response".to_string(), String::new()))?;

        serde_json::from_str(&content).map_err(|e| LlmError::Parse(e.to_string(), content))
    }

    /// Multi-turn tool-calling completion for the agentic loop (C8). The
    /// caller owns the transcript and re-submits it each iteration.
    pub async fn complete_with_tools(
        &self,
        endpoint: &LlmEndpoint,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        force_tool: Option<&str>,
    ) -> Result<ResponseMessage, LlmError> {
        let tool_choice = force_tool.map(|name| {
            serde_json::json!({ "type": "function", "function": { "name": name } })
        });

        let body = ChatCompletionRequest {
            model: endpoint.model.clone(),
            messages,
            max_tokens: Some(endpoint.max_tokens as u32),
            temperature: Some(endpoint.temperature),
            response_format: None,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
        };

        let response = self.post_chat(endpoint, &body).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::Parse("empty response".to_string(), String::new()))
    }

    async fn post_chat(
        &self,
        endpoint: &LlmEndpoint,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", endpoint.api_base.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .timeout(endpoint.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(endpoint.timeout.as_secs())
                } else {
                    LlmError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if status.is_server_error() {
            return Err(LlmError::Api(format!("server error {status}")));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {text}")));
        }

        response.json().await.map_err(|e| LlmError::Parse(e.to_string(), String::new()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self { role: "system".to_string(), content: Some(content.to_string()), tool_call_id: None, tool_calls: None }
    }

    pub fn user(content: &str) -> Self {
        Self { role: "user".to_string(), content: Some(content.to_string()), tool_call_id: None, tool_calls: None }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_call_id: Some(tool_call_id.to_string()),
            tool_calls: None,
        }
    }

    pub fn assistant(message: ResponseMessage) -> Self {
        Self {
            role: "assistant".to_string(),
            content: message.content,
            tool_call_id: None,
            tool_calls: message.tool_calls,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub r#type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub r#type: String,
    pub function: ToolFunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}
