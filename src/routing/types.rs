//! Routing request/result types

use crate::error::{RelayError, Result};
use crate::mcp::connection::ServerHealth;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// One tool invocation request
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque correlation id, unique per in-flight call
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// Build a call reusing a caller-chosen correlation id
    pub fn with_id(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Per-call result entry returned by batch execution
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub id: String,
    pub tool_name: String,
    pub result: Result<Value>,
    pub duration: Duration,
}

impl ToolCallOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The error, when the call failed
    pub fn error(&self) -> Option<&RelayError> {
        self.result.as_ref().err()
    }
}

/// Aggregate health report across all managed servers
#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    pub servers: Vec<ServerHealth>,
    pub total_servers: usize,
    pub connected_servers: usize,
    pub total_tools: usize,
}
