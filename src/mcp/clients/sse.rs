//! SSE transport client
//!
//! Asymmetric correlation: calls are issued as an HTTP POST carrying a
//! generated correlation id, and results arrive later as events on the
//! long-lived SSE stream. The stream reader feeds a [`ResponseQueue`]; each
//! call path awaits its own id there under one total wall-clock timeout.
//!
//! Endpoint layout relative to the configured URL: the event stream is the
//! URL itself, calls POST to `<url>/messages`, and tool discovery is a
//! side-channel GET of `<url>/tools`.

use crate::config::ServerDescriptor;
use crate::error::{RelayError, Result};
use crate::mcp::clients::queue::ResponseQueue;
use crate::mcp::types::{McpRequest, McpResponse, Tool, call_result_from_response};
use eventsource_client::{Client as _, SSE};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// A heartbeat older than this marks the connection stale
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(60);

/// Buffered stream responses beyond this are dropped oldest-first
const MAX_BUFFERED_RESPONSES: usize = 256;

/// SSE client for backend tool servers
pub struct SseTransport {
    /// Server name for identification
    server_name: String,
    /// Long-lived event stream endpoint
    stream_url: String,
    /// Call submission endpoint
    post_url: String,
    /// Side-channel tool discovery endpoint
    tools_url: String,
    /// Pre-rendered auth header
    auth_header: Option<(String, String)>,
    /// Extra headers from the descriptor
    headers: HashMap<String, String>,
    /// HTTP client for the POST channel and discovery GET
    http_client: reqwest::Client,
    /// Default request timeout
    request_timeout: Duration,
    /// Correlation queue fed by the stream reader
    queue: Arc<ResponseQueue>,
    /// Stream reader task handle
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Time of the last heartbeat (any stream traffic counts)
    last_heartbeat: Arc<RwLock<Option<Instant>>>,
}

impl SseTransport {
    /// Create a new SSE transport from a server descriptor
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let base = descriptor
            .url
            .as_deref()
            .ok_or_else(|| RelayError::config(format!("Server '{}' has no url", descriptor.name)))?;

        Url::parse(base)
            .map_err(|e| RelayError::config(format!("Invalid SSE URL '{}': {}", base, e)))?;

        let base = base.trim_end_matches('/');

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(descriptor.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(descriptor.timeouts.connect_secs))
            .user_agent(concat!("opsrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            stream_url: base.to_string(),
            post_url: format!("{}/messages", base),
            tools_url: format!("{}/tools", base),
            auth_header: descriptor.auth.header(),
            headers: descriptor.headers.clone(),
            http_client,
            request_timeout: Duration::from_secs(descriptor.timeouts.request_secs),
            queue: Arc::new(ResponseQueue::new(MAX_BUFFERED_RESPONSES)),
            reader_task: Mutex::new(None),
            last_heartbeat: Arc::new(RwLock::new(None)),
        })
    }

    /// Start the background event stream.
    ///
    /// The stream runs in the background; the manager must still complete
    /// tool discovery (a side-channel GET) before considering this transport
    /// usable.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to SSE server '{}' at {}", self.server_name, self.stream_url);

        let mut builder = eventsource_client::ClientBuilder::for_url(&self.stream_url)
            .map_err(|e| RelayError::connection(format!("Failed to create SSE client: {}", e)))?;

        let mut header_pairs: Vec<(String, String)> = self.headers.clone().into_iter().collect();
        if let Some(auth) = &self.auth_header {
            header_pairs.push(auth.clone());
        }
        for (name, value) in &header_pairs {
            builder = builder
                .header(name, value)
                .map_err(|e| RelayError::connection(format!("Invalid header {}: {}", name, e)))?;
        }

        let client = builder.build();

        let server_name = self.server_name.clone();
        let queue = Arc::clone(&self.queue);
        let last_heartbeat = Arc::clone(&self.last_heartbeat);

        let task = tokio::spawn(async move {
            let mut stream = client.stream();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(SSE::Event(event)) => {
                        *last_heartbeat.write().await = Some(Instant::now());

                        if event.event_type == "heartbeat" {
                            continue;
                        }

                        match serde_json::from_str::<McpResponse>(&event.data) {
                            Ok(response) => queue.push(response),
                            Err(e) => {
                                debug!(
                                    "Ignoring non-response SSE event from '{}' (type={}): {}",
                                    server_name, event.event_type, e
                                );
                            }
                        }
                    }
                    Ok(SSE::Comment(_)) => {
                        // Comments are commonly used as keepalives
                        *last_heartbeat.write().await = Some(Instant::now());
                    }
                    Err(e) => {
                        warn!("SSE stream error for server '{}': {}", server_name, e);
                        break;
                    }
                }
            }

            info!("SSE stream ended for server '{}'", server_name);
        });

        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    /// Tool discovery over the side-channel GET
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut builder = self.http_client.get(&self.tools_url);
        builder = self.apply_headers(builder);

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::connection(format!("Tool discovery GET failed for '{}': {}", self.server_name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::connection(format!(
                "Tool discovery for '{}' returned HTTP {}",
                self.server_name, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RelayError::connection(format!("Invalid discovery body from '{}': {}", self.server_name, e)))?;

        let tools_value = body.get("tools").ok_or_else(|| {
            RelayError::connection(format!("Missing 'tools' field in discovery response from '{}'", self.server_name))
        })?;

        serde_json::from_value(tools_value.clone())
            .map_err(|e| RelayError::connection(format!("Invalid tools format from '{}': {}", self.server_name, e)))
    }

    /// Issue a call over the POST channel and await its result on the stream
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let request = McpRequest::new(
            request_id.clone(),
            "tools/call",
            Some(json!({
                "name": tool_name,
                "arguments": arguments
            })),
        );

        // The timeout is total wall-clock: POST submission and the stream
        // wait share one deadline.
        let started = Instant::now();

        let mut builder = self.http_client.post(&self.post_url).timeout(timeout).json(&request);
        builder = self.apply_headers(builder);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::tool_call_timeout(tool_name, timeout.as_secs())
            } else {
                RelayError::connection(format!("Call POST to '{}' failed: {}", self.server_name, e))
            }
        })?;

        if !response.status().is_success() {
            return Err(RelayError::connection(format!(
                "Call POST to '{}' returned HTTP {}",
                self.server_name,
                response.status()
            )));
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match self.queue.take(&request_id, remaining).await {
            Some(response) => call_result_from_response(response, tool_name),
            None => Err(RelayError::tool_call_timeout(tool_name, timeout.as_secs())),
        }
    }

    /// Stale-heartbeat probe: have we seen stream traffic recently?
    pub async fn ping(&self) -> bool {
        match *self.last_heartbeat.read().await {
            Some(at) => at.elapsed() < HEARTBEAT_WINDOW,
            None => false,
        }
    }

    /// Stop the stream reader and fail in-flight waiters
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting SSE server '{}'", self.server_name);

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.queue.clear();
        *self.last_heartbeat.write().await = None;

        Ok(())
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some((name, value)) = &self.auth_header {
            builder = builder.header(name, value);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RetryPolicy, TimeoutConfig, TransportKind};

    fn descriptor(url: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: "ops-sse".to_string(),
            transport: TransportKind::Sse,
            url: Some(url.to_string()),
            command: None,
            args: Vec::new(),
            env: None,
            cwd: None,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            enabled: true,
            enabled_tools: None,
            disabled_tools: None,
            auth: AuthConfig::None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_endpoint_layout() {
        let transport = SseTransport::new(&descriptor("https://ops.internal/sse/")).unwrap();
        assert_eq!(transport.stream_url, "https://ops.internal/sse");
        assert_eq!(transport.post_url, "https://ops.internal/sse/messages");
        assert_eq!(transport.tools_url, "https://ops.internal/sse/tools");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(SseTransport::new(&descriptor("not-a-url")).is_err());
    }

    #[tokio::test]
    async fn test_ping_is_false_before_any_heartbeat() {
        let transport = SseTransport::new(&descriptor("https://ops.internal/sse")).unwrap();
        assert!(!transport.ping().await);
    }

    #[tokio::test]
    async fn test_ping_true_after_recent_heartbeat() {
        let transport = SseTransport::new(&descriptor("https://ops.internal/sse")).unwrap();
        *transport.last_heartbeat.write().await = Some(Instant::now());
        assert!(transport.ping().await);
    }
}
