//! Conversation, decision and output-event types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in the conversation history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Correlation id of the tool call this message answers (tool role)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    /// Tool invocations requested by the assistant (assistant role)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<LlmToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Assistant message carrying the requested tool calls
    pub fn assistant_tool_calls(calls: Vec<LlmToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    /// Tool-role message keyed by the call's correlation id
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

/// One tool invocation requested by the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    /// Correlation id assigned by the LLM provider
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Outcome of the phase-1 decision call.
///
/// Branching on the decision is a value inspection, never exception
/// handling.
#[derive(Debug, Clone)]
pub enum Decision {
    /// No tool invocations: fall through to a plain streamed reply
    NoTools,
    /// Execute these calls, then generate from their masked results
    ToolCalls(Vec<LlmToolCall>),
}

/// Events streamed to the caller over one conversation turn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Plain text fragment of the answer
    Text { content: String },
    /// A tool call has been dispatched
    ToolCallStarted { id: String, tool_name: String },
    /// A tool call completed; `summary` is a short human-readable line,
    /// never the raw payload
    ToolCallFinished {
        id: String,
        tool_name: String,
        success: bool,
        summary: String,
    },
    /// Terminal correction: replace everything displayed so far with
    /// `content`. Idempotent-safe — replacing identical text is a visual
    /// no-op.
    ContentUpdate { content: String },
}
