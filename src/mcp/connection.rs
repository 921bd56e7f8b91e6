//! Per-server connection management
//!
//! One `ConnectionManager` per server descriptor. It owns the transport,
//! the connection status machine, tool discovery and filtering, and the
//! reconnect backoff. Status transitions are linear:
//! DISCONNECTED → CONNECTING → {CONNECTED | ERROR}; ERROR and CONNECTED
//! reach DISCONNECTED via `disconnect()`, and ERROR re-enters CONNECTING
//! only through an explicit `reconnect()`.

use crate::config::{RetryPolicy, ServerDescriptor};
use crate::error::{RelayError, Result};
use crate::mcp::clients::Transport;
use crate::mcp::types::Tool;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection status of one managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Health snapshot for one managed server
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub server: String,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    pub uptime_secs: Option<u64>,
    pub responsive: bool,
}

/// Manages one backend server: transport, status, discovered tools
pub struct ConnectionManager {
    descriptor: ServerDescriptor,
    transport: Transport,
    status: RwLock<ConnectionStatus>,
    tools: RwLock<Vec<Tool>>,
    connected_at: RwLock<Option<Instant>>,
}

impl ConnectionManager {
    /// Create a manager from a descriptor, building the matching transport
    pub fn new(descriptor: ServerDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let transport = Transport::from_descriptor(&descriptor)?;
        Ok(Self::with_transport(descriptor, transport))
    }

    /// Create a manager around a pre-built transport (in-process hosts)
    pub fn with_transport(descriptor: ServerDescriptor, transport: Transport) -> Self {
        Self {
            descriptor,
            transport,
            status: RwLock::new(ConnectionStatus::Disconnected),
            tools: RwLock::new(Vec::new()),
            connected_at: RwLock::new(None),
        }
    }

    /// Establish the connection and run tool discovery.
    ///
    /// The manager is only CONNECTED once discovery has completed — for
    /// stream-based transports the event stream may already be running in
    /// the background, but the manager is not usable before discovery
    /// returns. Any failure releases partial transport resources and leaves
    /// the manager in ERROR.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if *status == ConnectionStatus::Connected {
                return Ok(());
            }
            *status = ConnectionStatus::Connecting;
        }

        info!("Connecting to server '{}'", self.server_name());

        if let Err(e) = self.transport.connect().await {
            self.fail_connect().await;
            return Err(e);
        }

        let tools = match self.transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                self.fail_connect().await;
                return Err(e);
            }
        };

        let tools = self.filter_tools(tools);

        {
            let mut stored = self.tools.write().await;
            *stored = tools;
        }
        {
            let mut status = self.status.write().await;
            *status = ConnectionStatus::Connected;
        }
        {
            let mut connected_at = self.connected_at.write().await;
            *connected_at = Some(Instant::now());
        }

        info!(
            "Connected to server '{}' with {} tools",
            self.server_name(),
            self.tools.read().await.len()
        );
        Ok(())
    }

    async fn fail_connect(&self) {
        // Release partial resources (open sockets, spawned readers) before
        // reporting the failure.
        let _ = self.transport.disconnect().await;
        let mut status = self.status.write().await;
        *status = ConnectionStatus::Error;
    }

    /// Re-run discovery on an established connection, replacing the tool
    /// set wholesale
    pub async fn discover_tools(&self) -> Result<Vec<Tool>> {
        if !self.is_connected().await {
            return Err(RelayError::server_not_connected(self.server_name()));
        }

        let tools = self.filter_tools(self.transport.list_tools().await?);
        let mut stored = self.tools.write().await;
        *stored = tools.clone();
        Ok(tools)
    }

    /// Apply schema validation, the allow-list and the deny-list
    fn filter_tools(&self, tools: Vec<Tool>) -> Vec<Tool> {
        let mut tools: Vec<Tool> = tools
            .into_iter()
            .filter(|tool| match tool.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Rejecting tool '{}' from server '{}': {}",
                        tool.name,
                        self.server_name(),
                        e
                    );
                    false
                }
            })
            .collect();

        if let Some(allow) = &self.descriptor.enabled_tools {
            let published: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            for name in allow {
                if !published.contains(name.as_str()) {
                    warn!(
                        "Enabled tool '{}' is not published by server '{}'",
                        name,
                        self.server_name()
                    );
                }
            }
            let allow: HashSet<&str> = allow.iter().map(String::as_str).collect();
            tools.retain(|tool| allow.contains(tool.name.as_str()));
        }

        if let Some(deny) = &self.descriptor.disabled_tools {
            let deny: HashSet<&str> = deny.iter().map(String::as_str).collect();
            tools.retain(|tool| !deny.contains(tool.name.as_str()));
        }

        tools
    }

    /// Call a tool with a total wall-clock timeout.
    ///
    /// Fails with `ServerNotConnected` without touching the transport when
    /// the manager is not CONNECTED. Arguments are validated against the
    /// discovered schema before dispatch.
    pub async fn call(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        if !self.is_connected().await {
            return Err(RelayError::server_not_connected(self.server_name()));
        }

        {
            let tools = self.tools.read().await;
            let tool = tools
                .iter()
                .find(|t| t.name == tool_name)
                .ok_or_else(|| RelayError::tool_not_found(tool_name))?;
            tool.validate_arguments(&arguments)?;
        }

        debug!("Calling tool '{}' on server '{}'", tool_name, self.server_name());

        match tokio::time::timeout(timeout, self.transport.call_tool(tool_name, arguments, timeout)).await {
            Ok(result) => result,
            // The transport request is not actively aborted on all
            // transports; a late result is discarded by id mismatch.
            Err(_) => Err(RelayError::tool_call_timeout(tool_name, timeout.as_secs())),
        }
    }

    /// Liveness probe; semantics are per-transport (protocol ping, /health
    /// GET, heartbeat recency, process liveness). A stale result is a signal
    /// for the supervising layer to reconnect, never an automatic disconnect.
    pub async fn ping(&self) -> bool {
        if !self.is_connected().await {
            return false;
        }
        self.transport.ping().await
    }

    /// Tear down the connection
    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await?;

        let mut status = self.status.write().await;
        *status = ConnectionStatus::Disconnected;
        drop(status);

        let mut connected_at = self.connected_at.write().await;
        *connected_at = None;
        drop(connected_at);

        let mut tools = self.tools.write().await;
        tools.clear();

        Ok(())
    }

    /// Reconnect with exponential backoff.
    ///
    /// Waits `base_delay * 2^(attempt-1)` before each attempt, capped at the
    /// policy's maximum delay, and gives up with a terminal connection error
    /// after the configured attempt count.
    pub async fn reconnect(&self) -> Result<()> {
        let policy = self.descriptor.retry.clone();

        // Drop transport state from the failed connection first.
        let _ = self.transport.disconnect().await;
        {
            let mut status = self.status.write().await;
            *status = ConnectionStatus::Disconnected;
        }

        for attempt in 1..=policy.max_attempts {
            let delay = backoff_delay(&policy, attempt);
            info!(
                "Reconnecting to server '{}' (attempt {}/{}) after {:?}",
                self.server_name(),
                attempt,
                policy.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Reconnect attempt {}/{} to server '{}' failed: {}",
                        attempt,
                        policy.max_attempts,
                        self.server_name(),
                        e
                    );
                }
            }
        }

        Err(RelayError::connection(format!(
            "Giving up on server '{}' after {} reconnect attempts",
            self.server_name(),
            policy.max_attempts
        )))
    }

    /// Current status
    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.status.read().await == ConnectionStatus::Connected
    }

    /// Snapshot of the discovered (filtered) tool set
    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    /// Health snapshot for this server
    pub async fn health(&self) -> ServerHealth {
        let status = self.status().await;
        ServerHealth {
            server: self.server_name().to_string(),
            status,
            tool_count: self.tools.read().await.len(),
            uptime_secs: self.connected_at.read().await.map(|at| at.elapsed().as_secs()),
            responsive: self.ping().await,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// The in-process host backing a `local` descriptor, when applicable
    pub fn local_host(&self) -> Option<&crate::mcp::clients::LocalTransport> {
        match &self.transport {
            Transport::Local(host) => Some(host),
            _ => None,
        }
    }
}

/// Backoff delay before the given 1-based attempt, capped by the policy
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms);
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, TimeoutConfig, TransportKind};
    use crate::mcp::clients::LocalTransport;
    use serde_json::json;
    use std::collections::HashMap;

    fn local_descriptor() -> ServerDescriptor {
        ServerDescriptor {
            name: "builtin".to_string(),
            transport: TransportKind::Local,
            url: None,
            command: None,
            args: Vec::new(),
            env: None,
            cwd: None,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 10,
            },
            enabled: true,
            enabled_tools: None,
            disabled_tools: None,
            auth: AuthConfig::None,
            headers: HashMap::new(),
        }
    }

    async fn host_with_tools(names: &[&str]) -> LocalTransport {
        let host = LocalTransport::new("builtin");
        for name in names {
            let tool = Tool::new(*name, "test tool", json!({"type": "object"})).unwrap();
            host.register(tool, |_| Box::pin(async { Ok(json!({"ok": true})) }))
                .await
                .unwrap();
        }
        host
    }

    #[tokio::test]
    async fn test_call_before_connect_is_server_not_connected() {
        let host = host_with_tools(&["cluster_status"]).await;
        let manager = ConnectionManager::with_transport(local_descriptor(), Transport::Local(host));

        assert_eq!(manager.status().await, ConnectionStatus::Disconnected);
        let err = manager
            .call("cluster_status", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "server_not_connected");
    }

    #[tokio::test]
    async fn test_connect_discovers_and_calls() {
        let host = host_with_tools(&["cluster_status"]).await;
        let manager = ConnectionManager::with_transport(local_descriptor(), Transport::Local(host));

        manager.connect().await.unwrap();
        assert_eq!(manager.status().await, ConnectionStatus::Connected);
        assert_eq!(manager.tools().await.len(), 1);

        let result = manager
            .call("cluster_status", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));

        manager.disconnect().await.unwrap();
        assert_eq!(manager.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_allow_list_restricts_and_deny_list_subtracts() {
        let host = host_with_tools(&["fetch_logs", "scale_service", "drain_node"]).await;
        let mut descriptor = local_descriptor();
        descriptor.enabled_tools = Some(vec![
            "fetch_logs".to_string(),
            "scale_service".to_string(),
            "not_published".to_string(),
        ]);
        descriptor.disabled_tools = Some(vec!["scale_service".to_string()]);

        let manager = ConnectionManager::with_transport(descriptor, Transport::Local(host));
        manager.connect().await.unwrap();

        let names: Vec<String> = manager.tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["fetch_logs".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let mut descriptor = local_descriptor();
        descriptor.name = "ops-dead".to_string();
        descriptor.transport = TransportKind::Subprocess;
        descriptor.command = Some("/nonexistent/opsrelay-test-binary".to_string());

        let manager = ConnectionManager::new(descriptor).unwrap();
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.status().await, ConnectionStatus::Error);

        let err = manager.reconnect().await.unwrap_err();
        assert!(err.to_string().contains("2 reconnect attempts"));
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_attempts: 32,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=32 {
            let delay = backoff_delay(&policy, attempt);
            assert!(delay <= Duration::from_millis(30_000));
            assert!(delay >= previous);
            previous = delay;
        }

        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(30_000));
    }
}
