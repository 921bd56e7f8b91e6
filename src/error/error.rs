//! Error types and handling for the tool relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the tool relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (malformed server or tool descriptor)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level failure to establish or maintain a connection
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No connected server publishes the requested tool
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    /// The server owning the tool is not in the CONNECTED state
    #[error("Server '{server}' is not connected")]
    ServerNotConnected { server: String },

    /// A tool call exceeded its wall-clock timeout
    #[error("Tool call '{tool_name}' timed out after {timeout_secs}s")]
    ToolCallTimeout { tool_name: String, timeout_secs: u64 },

    /// The remote server reported a tool execution failure
    #[error("Tool call '{tool_name}' failed: {message}")]
    ToolCallFailed { tool_name: String, message: String },

    /// Masking or restoration failure (non-fatal by default)
    #[error("Masking error: {message}")]
    Masking { message: String },

    /// LLM provider errors
    #[error("LLM error: {message}")]
    Llm { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a tool-not-found error
    pub fn tool_not_found<S: Into<String>>(tool_name: S) -> Self {
        Self::ToolNotFound {
            tool_name: tool_name.into(),
        }
    }

    /// Create a server-not-connected error
    pub fn server_not_connected<S: Into<String>>(server: S) -> Self {
        Self::ServerNotConnected {
            server: server.into(),
        }
    }

    /// Create a tool-call timeout error
    pub fn tool_call_timeout<S: Into<String>>(tool_name: S, timeout_secs: u64) -> Self {
        Self::ToolCallTimeout {
            tool_name: tool_name.into(),
            timeout_secs,
        }
    }

    /// Create a tool-call failure error
    pub fn tool_call_failed<S: Into<String>>(tool_name: S, message: S) -> Self {
        Self::ToolCallFailed {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a masking error
    pub fn masking<S: Into<String>>(message: S) -> Self {
        Self::Masking {
            message: message.into(),
        }
    }

    /// Create an LLM provider error
    pub fn llm<S: Into<String>>(message: S) -> Self {
        Self::Llm {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Http(_) | RelayError::Io(_) | RelayError::Connection { .. }
        )
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Config { .. } => "config",
            RelayError::Connection { .. } => "connection",
            RelayError::ToolNotFound { .. } => "tool_not_found",
            RelayError::ServerNotConnected { .. } => "server_not_connected",
            RelayError::ToolCallTimeout { .. } => "tool_call_timeout",
            RelayError::ToolCallFailed { .. } => "tool_call_failed",
            RelayError::Masking { .. } => "masking",
            RelayError::Llm { .. } => "llm",
            RelayError::Io(_) => "io",
            RelayError::Serde(_) => "serialization",
            RelayError::Yaml(_) => "yaml",
            RelayError::Http(_) => "http",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Config { message } => RelayError::Config { message: message.clone() },
            RelayError::Connection { message } => RelayError::Connection { message: message.clone() },
            RelayError::ToolNotFound { tool_name } => RelayError::ToolNotFound { tool_name: tool_name.clone() },
            RelayError::ServerNotConnected { server } => RelayError::ServerNotConnected { server: server.clone() },
            RelayError::ToolCallTimeout { tool_name, timeout_secs } => RelayError::ToolCallTimeout {
                tool_name: tool_name.clone(),
                timeout_secs: *timeout_secs,
            },
            RelayError::ToolCallFailed { tool_name, message } => RelayError::ToolCallFailed {
                tool_name: tool_name.clone(),
                message: message.clone(),
            },
            RelayError::Masking { message } => RelayError::Masking { message: message.clone() },
            RelayError::Llm { message } => RelayError::Llm { message: message.clone() },

            // For non-cloneable types, convert to string representation
            RelayError::Io(e) => RelayError::connection(format!("IO error: {}", e)),
            RelayError::Serde(e) => RelayError::connection(format!("Serialization error: {}", e)),
            RelayError::Yaml(e) => RelayError::config(format!("YAML error: {}", e)),
            RelayError::Http(e) => RelayError::connection(format!("HTTP error: {}", e)),
            RelayError::Internal(e) => RelayError::connection(format!("Internal error: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(RelayError::config("bad").category(), "config");
        assert_eq!(RelayError::tool_not_found("scale_service").category(), "tool_not_found");
        assert_eq!(RelayError::server_not_connected("ops-east").category(), "server_not_connected");
        assert_eq!(RelayError::tool_call_timeout("fetch_logs", 30).category(), "tool_call_timeout");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RelayError::connection("reset by peer").is_retryable());
        assert!(!RelayError::tool_not_found("x").is_retryable());
        assert!(!RelayError::config("x").is_retryable());
    }

    #[test]
    fn test_clone_preserves_typed_variants() {
        let err = RelayError::tool_call_timeout("fetch_logs", 30);
        match err.clone() {
            RelayError::ToolCallTimeout { tool_name, timeout_secs } => {
                assert_eq!(tool_name, "fetch_logs");
                assert_eq!(timeout_secs, 30);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_display_includes_context() {
        let err = RelayError::server_not_connected("ops-east");
        assert!(err.to_string().contains("ops-east"));
        let err = RelayError::tool_call_failed("restart_pod", "permission denied");
        assert!(err.to_string().contains("restart_pod"));
        assert!(err.to_string().contains("permission denied"));
    }
}
