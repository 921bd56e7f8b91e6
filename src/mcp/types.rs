//! Wire types for the tool protocol
//!
//! Tool schemas are exchanged as JSON-Schema-shaped objects; every outbound
//! call carries a caller-chosen opaque string correlation id.

use crate::error::{RelayError, Result};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request sent to a backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    /// Correlation id; absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Build a request with the given correlation id
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::String(id.into())),
            method: method.into(),
            params,
        }
    }

    /// The correlation id as a string, when present
    pub fn id_str(&self) -> Option<String> {
        self.id.as_ref().map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// JSON-RPC response received from a backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    /// Correlation id matched against the originating request
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

/// Servers are allowed to echo ids back as numbers; normalize to strings.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// JSON-RPC error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }
}

/// Tool definition discovered from a backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (unique identifier across the aggregate registry)
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    /// JSON Schema for input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Optional category (e.g. "cluster", "logs", "scaling")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub category: Option<String>,
}

impl Tool {
    /// Create a new tool with validation
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Result<Self> {
        let tool = Tool {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
            category: None,
        };
        tool.validate()?;
        Ok(tool)
    }

    /// Validate the tool definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RelayError::config("Tool name cannot be empty"));
        }

        self.validate_input_schema()
    }

    /// Validate that the input schema is a valid JSON Schema
    pub fn validate_input_schema(&self) -> Result<()> {
        match JSONSchema::compile(&self.input_schema) {
            Ok(_) => Ok(()),
            Err(e) => Err(RelayError::config(format!(
                "Invalid JSON Schema for tool '{}': {}",
                self.name, e
            ))),
        }
    }

    /// Validate arguments against the input schema
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let schema = JSONSchema::compile(&self.input_schema).map_err(|e| {
            RelayError::config(format!("Failed to compile schema for tool '{}': {}", self.name, e))
        })?;

        if let Err(errors) = schema.validate(arguments) {
            let error_messages: Vec<String> = errors.map(|e| format!("  - {}", e)).collect();
            return Err(RelayError::tool_call_failed(
                self.name.clone(),
                format!("Invalid arguments:\n{}", error_messages.join("\n")),
            ));
        }

        Ok(())
    }
}

/// Extract the tool list out of a `tools/list` response
pub fn tools_from_response(response: McpResponse, server: &str) -> Result<Vec<Tool>> {
    if let Some(error) = response.error {
        return Err(RelayError::connection(format!(
            "Server '{}' returned an error listing tools: {}",
            server, error.message
        )));
    }

    let result = response.result.ok_or_else(|| {
        RelayError::connection(format!("Empty tools/list response from server '{}'", server))
    })?;

    let tools_value = result.get("tools").ok_or_else(|| {
        RelayError::connection(format!(
            "Missing 'tools' field in tools/list response from server '{}'",
            server
        ))
    })?;

    serde_json::from_value(tools_value.clone())
        .map_err(|e| RelayError::connection(format!("Invalid tools format from server '{}': {}", server, e)))
}

/// Extract the call result out of a `tools/call` response
pub fn call_result_from_response(response: McpResponse, tool_name: &str) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(RelayError::tool_call_failed(
            tool_name.to_string(),
            error.message,
        ));
    }

    response
        .result
        .ok_or_else(|| RelayError::tool_call_failed(tool_name.to_string(), "Empty response".to_string()))
}
