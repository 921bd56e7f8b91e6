//! HTTP transport client
//!
//! Synchronous request/reply: the call and its response occur on the same
//! HTTP exchange. Provides connection pooling, authentication and bounded
//! retry on transport-level failures.

use crate::config::ServerDescriptor;
use crate::error::{RelayError, Result};
use crate::mcp::types::{self, McpRequest, McpResponse, Tool};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_RETRY_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// HTTP client for backend servers exposing the tool protocol over POST
pub struct HttpTransport {
    /// Server name for identification
    server_name: String,
    /// HTTP client with connection pooling
    http_client: Client,
    /// JSON-RPC endpoint
    endpoint: Url,
    /// Health endpoint used by ping()
    health_endpoint: Url,
    /// Auth header, pre-rendered
    auth_header: Option<(String, String)>,
    /// Extra headers from the descriptor
    headers: HashMap<String, String>,
    /// Default request timeout
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport from a server descriptor
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let base = descriptor.url.as_deref().ok_or_else(|| {
            RelayError::config(format!("Server '{}' has no url", descriptor.name))
        })?;

        let endpoint = Url::parse(base).map_err(|e| {
            RelayError::config(format!("Invalid base URL '{}': {}", base, e))
        })?;

        let health_endpoint = endpoint.join("/health").map_err(|e| {
            RelayError::config(format!("Cannot derive health endpoint for '{}': {}", base, e))
        })?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(descriptor.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(descriptor.timeouts.connect_secs))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("opsrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            http_client,
            endpoint,
            health_endpoint,
            auth_header: descriptor.auth.header(),
            headers: descriptor.headers.clone(),
            request_timeout: Duration::from_secs(descriptor.timeouts.request_secs),
        })
    }

    /// HTTP is connectionless; connect() only verifies the endpoint responds
    pub async fn connect(&self) -> Result<()> {
        debug!("HTTP transport for '{}' ready at {}", self.server_name, self.endpoint);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// List tools published by the server
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let request = McpRequest::new(Uuid::new_v4().to_string(), "tools/list", None);
        let response = self.send_request(&request, self.request_timeout).await?;
        types::tools_from_response(response, &self.server_name)
    }

    /// Call a tool and wait for the reply on the same exchange
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let request = McpRequest::new(
            Uuid::new_v4().to_string(),
            "tools/call",
            Some(json!({
                "name": tool_name,
                "arguments": arguments
            })),
        );

        let response = self.send_request(&request, timeout).await?;
        types::call_result_from_response(response, tool_name)
    }

    /// Health probe: GET /health
    pub async fn ping(&self) -> bool {
        let mut builder = self.http_client.get(self.health_endpoint.clone());
        builder = self.apply_headers(builder);

        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed for HTTP server '{}': {}", self.server_name, e);
                false
            }
        }
    }

    /// Send a request, retrying transport-level failures
    async fn send_request(&self, request: &McpRequest, timeout: Duration) -> Result<McpResponse> {
        let mut attempts = 0;
        let max_attempts = DEFAULT_RETRY_ATTEMPTS + 1;

        loop {
            attempts += 1;

            match self.send_single_request(request, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if attempts < max_attempts && e.is_retryable() => {
                    warn!(
                        "HTTP request to '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.server_name, attempts, max_attempts, e, RETRY_DELAY
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_single_request(&self, request: &McpRequest, timeout: Duration) -> Result<McpResponse> {
        debug!(
            "Sending HTTP request to '{}': method={}, id={:?}",
            self.server_name, request.method, request.id
        );

        let mut builder = self
            .http_client
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(request);
        builder = self.apply_headers(builder);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::connection(format!("Request to '{}' timed out", self.server_name))
            } else {
                RelayError::connection(format!("HTTP request to '{}' failed: {}", self.server_name, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RelayError::connection(format!(
                "HTTP {} from server '{}': {}",
                status, self.server_name, error_text
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RelayError::connection(format!("Failed to read response body: {}", e)))?;

        let mcp_response: McpResponse = serde_json::from_str(&body)
            .map_err(|e| RelayError::connection(format!("Invalid response JSON from '{}': {}", self.server_name, e)))?;

        debug!(
            "Received HTTP response from '{}': id={}, success={}",
            self.server_name,
            mcp_response.id,
            mcp_response.error.is_none()
        );

        Ok(mcp_response)
    }

    fn apply_headers(&self, mut builder: RequestBuilder) -> RequestBuilder {
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
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(url: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: "ops-east".to_string(),
            transport: TransportKind::Http,
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
            auth: AuthConfig::Bearer { token: "t0k".to_string() },
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut d = descriptor("not a url");
        d.auth = AuthConfig::None;
        assert!(HttpTransport::new(&d).is_err());
    }

    #[tokio::test]
    async fn test_list_tools_over_http() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer t0k"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "1",
                "result": {
                    "tools": [
                        {"name": "fetch_logs", "inputSchema": {"type": "object"}}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&descriptor(&server.uri())).unwrap();
        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "fetch_logs");
    }

    #[tokio::test]
    async fn test_call_tool_remote_error_is_tool_call_failed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "1",
                "error": {"code": -32000, "message": "no such cluster"}
            })))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&descriptor(&server.uri())).unwrap();
        let err = transport
            .call_tool("cluster_status", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "tool_call_failed");
    }

    #[tokio::test]
    async fn test_ping_uses_health_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&descriptor(&server.uri())).unwrap();
        assert!(transport.ping().await);
    }
}
