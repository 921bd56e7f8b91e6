//! Configuration for backend servers, tool overrides, masking and the LLM provider
//!
//! Descriptors are immutable once loaded. The (external) configuration subsystem
//! owns persistence and versioning; this module only parses, applies environment
//! overrides and validates.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Transport used to reach a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Websocket,
    Http,
    Sse,
    StreamHttp,
    Subprocess,
    Local,
}

impl TransportKind {
    /// Whether this transport is reached over a URL endpoint
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TransportKind::Websocket | TransportKind::Http | TransportKind::Sse | TransportKind::StreamHttp
        )
    }
}

/// Authentication configuration for a backend server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication
    None,
    /// Bearer token authentication
    Bearer { token: String },
    /// API Key authentication (header-based)
    ApiKey { header: String, key: String },
    /// Basic authentication
    Basic { username: String, password: String },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

impl AuthConfig {
    /// Render the auth scheme as a request header, when it maps to one
    pub fn header(&self) -> Option<(String, String)> {
        use base64::Engine as _;

        match self {
            AuthConfig::None => None,
            AuthConfig::Bearer { token } => {
                Some(("Authorization".to_string(), format!("Bearer {}", token)))
            }
            AuthConfig::ApiKey { header, key } => Some((header.clone(), key.clone())),
            AuthConfig::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Some(("Authorization".to_string(), format!("Basic {}", credentials)))
            }
        }
    }
}

/// Connection and request timeouts for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            request_secs: default_request_timeout(),
        }
    }
}

/// Reconnection policy for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum reconnection attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Descriptor for one backend tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name
    pub name: String,
    /// Transport kind
    pub transport: TransportKind,
    /// Endpoint URL for network transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Command to execute for subprocess transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for subprocess transports
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for subprocess transports (supports ${VAR} expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Working directory for subprocess transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Reconnection policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Whether this server participates in discovery and routing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Allow-list: when present the discovered tool set is restricted to these names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
    /// Deny-list: subtracted regardless of the allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_tools: Option<Vec<String>>,
    /// Authentication
    #[serde(default)]
    pub auth: AuthConfig,
    /// Extra headers sent on every request (network transports)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl ServerDescriptor {
    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RelayError::config("Server name cannot be empty"));
        }

        if self.transport.is_network() {
            let url = self.url.as_deref().ok_or_else(|| {
                RelayError::config(format!("Server '{}' requires a url for its transport", self.name))
            })?;
            url::Url::parse(url).map_err(|e| {
                RelayError::config(format!("Server '{}' has an invalid url '{}': {}", self.name, url, e))
            })?;
        }

        if self.transport == TransportKind::Subprocess && self.command.as_deref().map_or(true, str::is_empty) {
            return Err(RelayError::config(format!(
                "Server '{}' requires a command for the subprocess transport",
                self.name
            )));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(RelayError::config(format!(
                "Server '{}' retry base delay must be positive",
                self.name
            )));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(RelayError::config(format!(
                "Server '{}' retry cap is below its base delay",
                self.name
            )));
        }

        Ok(())
    }
}

/// Per-tool override applied by the router before dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    /// Timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default arguments merged under caller-supplied arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_arguments: Option<Value>,
    /// Whether the tool may be called at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Masking engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingConfig {
    /// Session inactivity TTL in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Fail-closed: surface masking errors instead of returning unmasked data
    #[serde(default)]
    pub fail_closed: bool,
}

fn default_session_ttl() -> u64 {
    3600
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            fail_closed: false,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (openai-compatible endpoints)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// API base URL override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Maximum tokens for generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: "gpt-4o-mini".to_string(),
            api_base_url: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            max_tokens: Some(4000),
            temperature: Some(0.7),
            request_timeout_secs: default_llm_timeout(),
        }
    }
}

/// Top-level configuration consumed by the relay core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Backend server descriptors
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    /// Per-tool overrides keyed by tool name
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,
    /// Masking engine settings
    #[serde(default)]
    pub masking: MaskingConfig,
    /// LLM provider settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,
}

impl Config {
    /// Load .env files in order of precedence
    fn load_env_files() {
        let env = std::env::var("OPSRELAY_ENV").unwrap_or_else(|_| "development".to_string());

        let env_specific_file = format!(".env.{}", env);
        let env_files = vec![".env", env_specific_file.as_str(), ".env.local"];

        for env_file in env_files {
            match dotenvy::from_filename(env_file) {
                Ok(_) => {
                    info!("Loaded environment variables from {}", env_file);
                }
                Err(e) if e.to_string().contains("not found") => {
                    debug!("No {} file found, skipping", env_file);
                }
                Err(e) => {
                    warn!("Failed to load {}: {}", env_file, e);
                }
            }
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_env_files();

        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RelayError::config(format!("Failed to read config file: {}", e)))?;

            serde_yaml::from_str(&content)
                .map_err(|e| RelayError::config(format!("Failed to parse config file: {}", e)))?
        } else {
            warn!("Config file not found, using defaults");
            Self::default()
        };

        config.apply_environment_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Ok(ttl_str) = std::env::var("OPSRELAY_MASKING_TTL_SECS") {
            if !ttl_str.is_empty() {
                self.masking.session_ttl_secs = ttl_str.parse().map_err(|e| {
                    RelayError::config(format!("Invalid OPSRELAY_MASKING_TTL_SECS: {}", e))
                })?;
            }
        }

        if let Ok(fail_closed) = std::env::var("OPSRELAY_MASKING_FAIL_CLOSED") {
            if !fail_closed.is_empty() {
                self.masking.fail_closed = fail_closed.parse().map_err(|e| {
                    RelayError::config(format!("Invalid OPSRELAY_MASKING_FAIL_CLOSED: {}", e))
                })?;
            }
        }

        if let Ok(model) = std::env::var("OPSRELAY_LLM_MODEL") {
            if !model.is_empty() {
                if let Some(llm) = self.llm.as_mut() {
                    llm.model = model;
                }
            }
        }

        Ok(())
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(RelayError::config(format!(
                    "Duplicate server name '{}'",
                    server.name
                )));
            }
        }

        if self.masking.session_ttl_secs == 0 {
            return Err(RelayError::config("Masking session TTL must be positive"));
        }

        for (name, overrides) in &self.tool_overrides {
            if let Some(args) = &overrides.default_arguments {
                if !args.is_object() {
                    return Err(RelayError::config(format!(
                        "Default arguments for tool '{}' must be an object",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}
