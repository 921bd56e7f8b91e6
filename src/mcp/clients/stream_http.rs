//! Stream-HTTP transport client
//!
//! Same asymmetric correlation model as SSE, framed as newline-delimited
//! JSON over one long-lived HTTP response body instead of SSE events:
//! requests POST to `<url>/mcp` and every result arrives as a line on the
//! `<url>/stream` GET. Results are matched to callers through the shared
//! [`ResponseQueue`].

use crate::config::ServerDescriptor;
use crate::error::{RelayError, Result};
use crate::mcp::clients::queue::ResponseQueue;
use crate::mcp::types::{self, McpRequest, McpResponse, Tool};
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

/// Stream-HTTP client for backend tool servers
pub struct StreamHttpTransport {
    /// Server name for identification
    server_name: String,
    /// Long-lived NDJSON stream endpoint
    stream_url: String,
    /// Call submission endpoint
    post_url: String,
    /// Pre-rendered auth header
    auth_header: Option<(String, String)>,
    /// Extra headers from the descriptor
    headers: HashMap<String, String>,
    /// HTTP client for both channels
    http_client: reqwest::Client,
    /// Default request timeout
    request_timeout: Duration,
    /// Correlation queue fed by the stream reader
    queue: Arc<ResponseQueue>,
    /// Stream reader task handle
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Time of the last line seen on the stream
    last_heartbeat: Arc<RwLock<Option<Instant>>>,
}

impl StreamHttpTransport {
    /// Create a new Stream-HTTP transport from a server descriptor
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let base = descriptor
            .url
            .as_deref()
            .ok_or_else(|| RelayError::config(format!("Server '{}' has no url", descriptor.name)))?;

        Url::parse(base)
            .map_err(|e| RelayError::config(format!("Invalid Stream-HTTP URL '{}': {}", base, e)))?;

        let base = base.trim_end_matches('/');

        // No global timeout on this client: the stream GET must outlive any
        // single request. Per-request timeouts are set on the POST path.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(descriptor.timeouts.connect_secs))
            .user_agent(concat!("opsrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            stream_url: format!("{}/stream", base),
            post_url: format!("{}/mcp", base),
            auth_header: descriptor.auth.header(),
            headers: descriptor.headers.clone(),
            http_client,
            request_timeout: Duration::from_secs(descriptor.timeouts.request_secs),
            queue: Arc::new(ResponseQueue::new(MAX_BUFFERED_RESPONSES)),
            reader_task: Mutex::new(None),
            last_heartbeat: Arc::new(RwLock::new(None)),
        })
    }

    /// Open the long-lived stream and start the line reader
    pub async fn connect(&self) -> Result<()> {
        info!(
            "Connecting to Stream-HTTP server '{}' at {}",
            self.server_name, self.stream_url
        );

        let mut builder = self
            .http_client
            .get(&self.stream_url)
            .header("Accept", "application/x-ndjson");
        builder = self.apply_headers(builder);

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::connection(format!("Stream GET to '{}' failed: {}", self.server_name, e)))?;

        if !response.status().is_success() {
            return Err(RelayError::connection(format!(
                "Stream GET to '{}' returned HTTP {}",
                self.server_name,
                response.status()
            )));
        }

        let server_name = self.server_name.clone();
        let queue = Arc::clone(&self.queue);
        let last_heartbeat = Arc::clone(&self.last_heartbeat);

        let task = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Stream-HTTP body error for server '{}': {}", server_name, e);
                        break;
                    }
                };

                match std::str::from_utf8(&chunk) {
                    Ok(text) => buffer.push_str(text),
                    Err(e) => {
                        warn!("Non-UTF8 stream chunk from '{}': {}", server_name, e);
                        continue;
                    }
                }

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    *last_heartbeat.write().await = Some(Instant::now());
                    Self::route_line(line, &server_name, &queue);
                }
            }

            info!("Stream-HTTP stream ended for server '{}'", server_name);
        });

        *self.reader_task.lock().await = Some(task);

        *self.last_heartbeat.write().await = Some(Instant::now());
        Ok(())
    }

    fn route_line(line: &str, server_name: &str, queue: &ResponseQueue) {
        // Heartbeat frames are not correlated responses
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if value.get("event").and_then(Value::as_str) == Some("heartbeat") {
                return;
            }
        }

        match serde_json::from_str::<McpResponse>(line) {
            Ok(response) => queue.push(response),
            Err(e) => {
                debug!("Ignoring unparseable stream line from '{}': {}", server_name, e);
            }
        }
    }

    /// Tool discovery: issued over the POST channel, answered on the stream
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let response = self.send_request("tools/list", None, self.request_timeout).await?;
        types::tools_from_response(response, &self.server_name)
    }

    /// Issue a call over the POST channel and await its result on the stream
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let response = self
            .send_request(
                "tools/call",
                Some(json!({
                    "name": tool_name,
                    "arguments": arguments
                })),
                timeout,
            )
            .await
            .map_err(|e| match e {
                RelayError::Connection { message } if message.contains("timed out") => {
                    RelayError::tool_call_timeout(tool_name, timeout.as_secs())
                }
                other => other,
            })?;

        types::call_result_from_response(response, tool_name)
    }

    async fn send_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<McpResponse> {
        let request_id = Uuid::new_v4().to_string();
        let request = McpRequest::new(request_id.clone(), method, params);

        // One total wall-clock deadline spans submission and the stream wait.
        let started = Instant::now();

        let mut builder = self
            .http_client
            .post(&self.post_url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(&request);
        builder = self.apply_headers(builder);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::connection(format!("Request to '{}' timed out", self.server_name))
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
        self.queue
            .take(&request_id, remaining)
            .await
            .ok_or_else(|| RelayError::connection(format!("Request to '{}' timed out", self.server_name)))
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
        info!("Disconnecting Stream-HTTP server '{}'", self.server_name);

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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RetryPolicy, TimeoutConfig, TransportKind};

    fn descriptor(url: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: "ops-stream".to_string(),
            transport: TransportKind::StreamHttp,
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
        let transport = StreamHttpTransport::new(&descriptor("https://ops.internal/relay")).unwrap();
        assert_eq!(transport.stream_url, "https://ops.internal/relay/stream");
        assert_eq!(transport.post_url, "https://ops.internal/relay/mcp");
    }

    #[test]
    fn test_heartbeat_lines_are_not_queued() {
        let queue = ResponseQueue::new(8);
        StreamHttpTransport::route_line(r#"{"event":"heartbeat"}"#, "ops-stream", &queue);
        assert_eq!(queue.buffered(), 0);

        StreamHttpTransport::route_line(
            r#"{"jsonrpc":"2.0","id":"7","result":{"ok":true}}"#,
            "ops-stream",
            &queue,
        );
        assert_eq!(queue.buffered(), 1);
    }

    #[tokio::test]
    async fn test_ping_is_false_before_connect() {
        let transport = StreamHttpTransport::new(&descriptor("https://ops.internal/relay")).unwrap();
        assert!(!transport.ping().await);
    }
}
