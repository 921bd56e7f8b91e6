//! LLM provider client
//!
//! `ChatModel` is the seam between the orchestrator and the provider: a
//! non-streaming decision call carrying the full tool schema set, and a
//! streaming generation call. `OpenAiChatModel` speaks the OpenAI-compatible
//! chat-completions API (which Ollama and most gateways also accept).

use crate::config::LlmConfig;
use crate::error::{RelayError, Result};
use crate::mcp::types::Tool;
use crate::orchestrator::types::{ChatMessage, Decision, LlmToolCall, Role};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::{debug, warn};

/// Stream of incremental answer chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The LLM seam used by the orchestrator
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Phase-1 decision: history plus the full tool schema set, tool-choice
    /// auto. Returns which tools (if any) the model wants to invoke.
    async fn decide(&self, messages: &[ChatMessage], tools: &[Tool]) -> Result<Decision>;

    /// Streaming generation from the given history
    async fn stream_reply(&self, messages: &[ChatMessage]) -> Result<ChunkStream>;
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiChatModel {
    config: LlmConfig,
    http_client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, http_client })
    }

    fn base_url(&self) -> &str {
        self.config
            .api_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }

    /// API key from the configured environment variable; providers running
    /// without auth (local gateways) may omit it.
    fn api_key(&self) -> Result<Option<String>> {
        match &self.config.api_key_env {
            Some(env_var) => match std::env::var(env_var) {
                Ok(key) if !key.is_empty() => Ok(Some(key)),
                _ => Err(RelayError::config(format!(
                    "Environment variable {} not set",
                    env_var
                ))),
            },
            None => Ok(None),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], tools: Option<&[Tool]>, stream: bool) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<Value>>(),
            "stream": stream,
        });

        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
                body["tool_choice"] = json!("auto");
            }
        }

        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url()))
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(key) = self.api_key()? {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::llm(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(RelayError::llm(format!("LLM API error {}: {}", status, error_text)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn decide(&self, messages: &[ChatMessage], tools: &[Tool]) -> Result<Decision> {
        debug!("Requesting tool decision from model '{}'", self.config.model);

        let body = self.request_body(messages, Some(tools), false);
        let response: Value = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::llm(format!("Invalid LLM response: {}", e)))?;

        let message = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| RelayError::llm("LLM response has no choices"))?;

        let tool_calls = match message.get("tool_calls").and_then(Value::as_array) {
            Some(calls) if !calls.is_empty() => calls,
            _ => return Ok(Decision::NoTools),
        };

        let mut parsed = Vec::with_capacity(tool_calls.len());
        for call in tool_calls {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let function = call
                .get("function")
                .ok_or_else(|| RelayError::llm("Tool call without function"))?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RelayError::llm("Tool call without name"))?
                .to_string();

            // Arguments arrive as a JSON-encoded string.
            let arguments = match function.get("arguments").and_then(Value::as_str) {
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                    warn!("Unparseable tool arguments for '{}': {}", name, e);
                    json!({})
                }),
                None => json!({}),
            };

            parsed.push(LlmToolCall { id, name, arguments });
        }

        Ok(Decision::ToolCalls(parsed))
    }

    async fn stream_reply(&self, messages: &[ChatMessage]) -> Result<ChunkStream> {
        debug!("Requesting streamed reply from model '{}'", self.config.model);

        let body = self.request_body(messages, None, true);
        let response = self.post(&body).await?;
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut done = false;

            while !done {
                let chunk = match byte_stream.next().await {
                    Some(chunk) => chunk.map_err(|e| RelayError::llm(format!("LLM stream error: {}", e)))?,
                    None => break,
                };

                let text = std::str::from_utf8(&chunk)
                    .map_err(|e| RelayError::llm(format!("Non-UTF8 LLM stream chunk: {}", e)))?;
                buffer.push_str(text);

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();

                    let data = match line.strip_prefix("data:") {
                        Some(data) => data.trim(),
                        None => continue,
                    };

                    if data == "[DONE]" {
                        done = true;
                        break;
                    }

                    let value = match serde_json::from_str::<Value>(data) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };
                    if let Some(content) = value
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        if !content.is_empty() {
                            yield content.to_string();
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = json!({
        "role": role,
        "content": message.content,
    });

    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if let Some(calls) = &message.tool_calls {
        wire["tool_calls"] = Value::Array(
            calls
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
                .collect(),
        );
    }

    wire
}

fn tool_to_wire(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description.clone().unwrap_or_default(),
            "parameters": tool.input_schema,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            provider: "openai".to_string(),
            model: "test-model".to_string(),
            api_base_url: Some(base_url.to_string()),
            api_key_env: None,
            max_tokens: Some(512),
            temperature: Some(0.0),
            request_timeout_secs: 10,
        }
    }

    fn history() -> Vec<ChatMessage> {
        vec![ChatMessage::user("check the api cluster")]
    }

    #[tokio::test]
    async fn test_decide_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"tool_choice": "auto"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "call-1",
                            "type": "function",
                            "function": {
                                "name": "cluster_status",
                                "arguments": "{\"cluster\":\"api\"}"
                            }
                        }]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(config(&server.uri())).unwrap();
        let tools = vec![Tool::new("cluster_status", "Cluster status", json!({"type": "object"})).unwrap()];

        match model.decide(&history(), &tools).await.unwrap() {
            Decision::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "cluster_status");
                assert_eq!(calls[0].arguments, json!({"cluster": "api"}));
            }
            Decision::NoTools => panic!("expected tool calls"),
        }
    }

    #[tokio::test]
    async fn test_decide_without_tool_calls_is_no_tools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "All quiet."}
                }]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(config(&server.uri())).unwrap();
        assert!(matches!(
            model.decide(&history(), &[]).await.unwrap(),
            Decision::NoTools
        ));
    }

    #[tokio::test]
    async fn test_stream_reply_yields_deltas() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(config(&server.uri())).unwrap();
        let mut stream = model.stream_reply(&history()).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap());
        }
        assert_eq!(collected, "Hello world");
    }

    #[tokio::test]
    async fn test_api_error_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new(config(&server.uri())).unwrap();
        let err = model.decide(&history(), &[]).await.unwrap_err();
        assert_eq!(err.category(), "llm");
    }
}
