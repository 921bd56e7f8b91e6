//! WebSocket transport client
//!
//! Full-duplex connection to a backend server. Requests and responses travel
//! on the same socket and are correlated by id through a pending-request map;
//! a split reader task routes incoming frames while a writer task drains an
//! outbound channel.

use crate::config::ServerDescriptor;
use crate::error::{RelayError, Result};
use crate::mcp::types::{self, McpRequest, McpResponse, Tool};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long ping() waits for the matching pong
const PONG_WAIT: Duration = Duration::from_secs(5);

/// WebSocket client for backend tool servers
pub struct WebSocketTransport {
    /// Server name for identification
    server_name: String,
    /// WebSocket URL
    url: String,
    /// Pre-rendered auth header
    auth_header: Option<(String, String)>,
    /// Extra headers from the descriptor
    headers: HashMap<String, String>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Default request timeout
    request_timeout: Duration,
    /// Pending requests awaiting responses
    pending_requests: Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>,
    /// Sender for outgoing frames
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    /// Shutdown signal for the writer task
    shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    /// Time of the last pong frame seen by the reader
    last_pong: Arc<RwLock<Option<Instant>>>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport from a server descriptor
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let url = descriptor
            .url
            .clone()
            .ok_or_else(|| RelayError::config(format!("Server '{}' has no url", descriptor.name)))?;

        Ok(Self {
            server_name: descriptor.name.clone(),
            url,
            auth_header: descriptor.auth.header(),
            headers: descriptor.headers.clone(),
            connect_timeout: Duration::from_secs(descriptor.timeouts.connect_secs),
            request_timeout: Duration::from_secs(descriptor.timeouts.request_secs),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            message_sender: Arc::new(Mutex::new(None)),
            shutdown_sender: Arc::new(Mutex::new(None)),
            last_pong: Arc::new(RwLock::new(None)),
        })
    }

    /// Establish the WebSocket connection and start the frame handlers
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to WebSocket server '{}' at {}", self.server_name, self.url);

        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| RelayError::connection(format!("Failed to create WebSocket request: {}", e)))?;

        let mut header_pairs: Vec<(String, String)> = self.headers.clone().into_iter().collect();
        if let Some(auth) = &self.auth_header {
            header_pairs.push(auth.clone());
        }
        for (key, value) in header_pairs {
            let header_name = key
                .parse::<tokio_tungstenite::tungstenite::http::HeaderName>()
                .map_err(|e| RelayError::connection(format!("Invalid header name {}: {}", key, e)))?;
            let header_value = value
                .parse::<tokio_tungstenite::tungstenite::http::HeaderValue>()
                .map_err(|e| RelayError::connection(format!("Invalid header value for {}: {}", key, e)))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                RelayError::connection(format!("WebSocket connection to '{}' timed out", self.server_name))
            })?
            .map_err(|e| RelayError::connection(format!("WebSocket connection failed: {}", e)))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Outgoing frame channel
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut sender = self.message_sender.lock().await;
            *sender = Some(msg_tx);
        }

        // Shutdown channel for the writer task
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        {
            let mut shutdown = self.shutdown_sender.lock().await;
            *shutdown = Some(shutdown_tx);
        }

        // Writer task
        let server_name = self.server_name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = msg_rx.recv() => {
                        match msg {
                            Some(message) => {
                                if let Err(e) = ws_sender.send(message).await {
                                    error!("Failed to send WebSocket frame to '{}': {}", server_name, e);
                                    break;
                                }
                            }
                            None => {
                                debug!("Outgoing frame channel closed for '{}'", server_name);
                                break;
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Shutdown signal for WebSocket writer of '{}'", server_name);
                        break;
                    }
                }
            }
        });

        // Reader task
        let server_name = self.server_name.clone();
        let pending_requests = Arc::clone(&self.pending_requests);
        let message_sender = Arc::clone(&self.message_sender);
        let last_pong = Arc::clone(&self.last_pong);

        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        Self::route_text_frame(&text, &server_name, &pending_requests).await;
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            Self::route_text_frame(&text, &server_name, &pending_requests).await;
                        } else {
                            warn!("Non-UTF8 binary frame from WebSocket server '{}'", server_name);
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Some(sender) = message_sender.lock().await.as_ref() {
                            let _ = sender.send(Message::Pong(data));
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        *last_pong.write().await = Some(Instant::now());
                    }
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed by server '{}': {:?}", server_name, frame);
                        break;
                    }
                    Ok(Message::Frame(_)) => {
                        warn!("Raw WebSocket frame from '{}'", server_name);
                    }
                    Err(e) => {
                        error!("WebSocket error for server '{}': {}", server_name, e);
                        break;
                    }
                }
            }

            // Fail any callers still waiting so they error instead of timing out.
            pending_requests.lock().await.clear();
            debug!("WebSocket reader ended for server '{}'", server_name);
        });

        info!("Connected to WebSocket server '{}'", self.server_name);
        Ok(())
    }

    async fn route_text_frame(
        text: &str,
        server_name: &str,
        pending_requests: &Arc<Mutex<HashMap<String, oneshot::Sender<McpResponse>>>>,
    ) {
        match serde_json::from_str::<McpResponse>(text) {
            Ok(response) => {
                let mut pending = pending_requests.lock().await;
                if let Some(sender) = pending.remove(&response.id) {
                    let id = response.id.clone();
                    if sender.send(response).is_err() {
                        // Caller abandoned the wait; discard by id mismatch.
                        debug!("Discarding response {} for abandoned request on '{}'", id, server_name);
                    }
                } else {
                    warn!(
                        "Response for unknown request id {} from WebSocket server '{}'",
                        response.id, server_name
                    );
                }
            }
            Err(e) => {
                warn!("Unparseable frame from WebSocket server '{}': {}", server_name, e);
            }
        }
    }

    /// Send a request and await the correlated response
    pub async fn send_request(&self, method: &str, params: Option<Value>, timeout_dur: Duration) -> Result<McpResponse> {
        let request_id = Uuid::new_v4().to_string();
        let request = McpRequest::new(request_id.clone(), method, params);

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.lock().await;
            pending.insert(request_id.clone(), response_tx);
        }

        let request_json = serde_json::to_string(&request)?;

        {
            let sender = self.message_sender.lock().await;
            match sender.as_ref() {
                Some(sender) => {
                    if sender.send(Message::Text(request_json)).is_err() {
                        self.pending_requests.lock().await.remove(&request_id);
                        return Err(RelayError::connection(format!(
                            "WebSocket writer for '{}' has stopped",
                            self.server_name
                        )));
                    }
                }
                None => {
                    self.pending_requests.lock().await.remove(&request_id);
                    return Err(RelayError::connection(format!(
                        "WebSocket server '{}' is not connected",
                        self.server_name
                    )));
                }
            }
        }

        match timeout(timeout_dur, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::connection(format!(
                "Connection to WebSocket server '{}' was lost",
                self.server_name
            ))),
            Err(_) => {
                self.pending_requests.lock().await.remove(&request_id);
                Err(RelayError::connection(format!(
                    "Request to WebSocket server '{}' timed out",
                    self.server_name
                )))
            }
        }
    }

    /// List tools published by the server
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let response = self.send_request("tools/list", None, self.request_timeout).await?;
        types::tools_from_response(response, &self.server_name)
    }

    /// Call a tool over the socket
    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout_dur: Duration) -> Result<Value> {
        let response = self
            .send_request(
                "tools/call",
                Some(json!({
                    "name": tool_name,
                    "arguments": arguments
                })),
                timeout_dur,
            )
            .await
            .map_err(|e| match e {
                RelayError::Connection { message } if message.contains("timed out") => {
                    RelayError::tool_call_timeout(tool_name, timeout_dur.as_secs())
                }
                other => other,
            })?;

        types::call_result_from_response(response, tool_name)
    }

    /// Protocol-level ping: send a Ping frame and wait for the pong
    pub async fn ping(&self) -> bool {
        let sent_at = Instant::now();
        {
            let sender = self.message_sender.lock().await;
            match sender.as_ref() {
                Some(sender) => {
                    if sender.send(Message::Ping(Vec::new())).is_err() {
                        return false;
                    }
                }
                None => return false,
            }
        }

        let deadline = Instant::now() + PONG_WAIT;
        while Instant::now() < deadline {
            if let Some(pong_at) = *self.last_pong.read().await {
                if pong_at >= sent_at {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Tear down the connection and fail in-flight calls
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from WebSocket server '{}'", self.server_name);

        if let Some(sender) = self.shutdown_sender.lock().await.take() {
            let _ = sender.send(());
        }

        *self.message_sender.lock().await = None;
        *self.last_pong.write().await = None;
        self.pending_requests.lock().await.clear();

        Ok(())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RetryPolicy, TimeoutConfig, TransportKind};

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor {
            name: "ops-ws".to_string(),
            transport: TransportKind::Websocket,
            url: Some("ws://ops-ws.internal:8080/tools".to_string()),
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

    #[tokio::test]
    async fn test_send_request_without_connection_fails() {
        let transport = WebSocketTransport::new(&descriptor()).unwrap();
        let err = transport
            .send_request("tools/list", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "connection");
    }

    #[tokio::test]
    async fn test_ping_without_connection_is_false() {
        let transport = WebSocketTransport::new(&descriptor()).unwrap();
        assert!(!transport.ping().await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_pending() {
        let transport = WebSocketTransport::new(&descriptor()).unwrap();
        {
            let (tx, _rx) = oneshot::channel();
            transport.pending_requests.lock().await.insert("in-flight".to_string(), tx);
        }
        transport.disconnect().await.unwrap();
        assert!(transport.pending_requests.lock().await.is_empty());
    }
}
