//! Aggregated tool client
//!
//! Fans discovery out across all enabled connection managers, keeps the flat
//! tool registry current, and dispatches calls to the owning manager with
//! per-tool configuration overlays applied.

use crate::config::{ServerDescriptor, ToolOverride};
use crate::error::{RelayError, Result};
use crate::mcp::connection::{ConnectionManager, ConnectionStatus};
use crate::mcp::types::Tool;
use crate::registry::{RegisteredTool, ToolRegistry};
use crate::routing::types::{RouterHealth, ToolCall, ToolCallOutcome};
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default per-call timeout when neither the tool override nor the
/// descriptor specifies one
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

type ConnectionMap = HashMap<String, Arc<ConnectionManager>>;

/// Routes tool calls to the connection manager owning each tool
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    /// Live connection set; swapped atomically on reload so in-flight calls
    /// complete against the set they started with
    connections: ArcSwap<ConnectionMap>,
    overrides: ArcSwap<HashMap<String, ToolOverride>>,
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ToolRegistry::new()),
            connections: ArcSwap::from_pointee(HashMap::new()),
            overrides: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Build and connect managers for every enabled descriptor.
    ///
    /// A server that fails to connect is kept in the set in its ERROR state
    /// (so a supervising layer can reconnect it) and does not abort the rest.
    pub async fn initialize(
        &self,
        descriptors: Vec<ServerDescriptor>,
        overrides: HashMap<String, ToolOverride>,
    ) -> Result<()> {
        let mut managers: ConnectionMap = HashMap::new();

        for descriptor in descriptors {
            if !descriptor.enabled {
                debug!("Skipping disabled server '{}'", descriptor.name);
                continue;
            }
            let name = descriptor.name.clone();
            managers.insert(name, Arc::new(ConnectionManager::new(descriptor)?));
        }

        join_all(managers.values().map(|manager| self.bring_up(Arc::clone(manager)))).await;

        self.connections.store(Arc::new(managers));
        self.overrides.store(Arc::new(overrides));

        info!(
            "Router initialized: {} servers, {} tools",
            self.connections.load().len(),
            self.registry.len()
        );
        Ok(())
    }

    /// Register an externally-constructed manager (in-process hosts, tests)
    pub async fn add_manager(&self, manager: Arc<ConnectionManager>) {
        self.bring_up(Arc::clone(&manager)).await;

        let mut managers: ConnectionMap = (**self.connections.load()).clone();
        managers.insert(manager.server_name().to_string(), manager);
        self.connections.store(Arc::new(managers));
    }

    /// Connect one manager and publish its tools
    async fn bring_up(&self, manager: Arc<ConnectionManager>) {
        match manager.connect().await {
            Ok(()) => {
                let tools = manager.tools().await;
                self.registry.replace_server_tools(manager.server_name(), tools);
            }
            Err(e) => {
                warn!("Server '{}' failed to connect: {}", manager.server_name(), e);
            }
        }
    }

    /// Every registered tool with its owning server
    pub fn list_registered(&self) -> Vec<RegisteredTool> {
        self.registry.list()
    }

    /// Every registered tool definition
    pub fn list_tools(&self) -> Vec<Tool> {
        self.registry.list().into_iter().map(|r| r.tool).collect()
    }

    /// Call one tool, applying the per-tool configuration overlay
    pub async fn call(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        let registration = self
            .registry
            .lookup(tool_name)
            .ok_or_else(|| RelayError::tool_not_found(tool_name))?;

        let overrides = self.overrides.load();
        let tool_override = overrides.get(tool_name);

        if let Some(o) = tool_override {
            if !o.enabled {
                return Err(RelayError::tool_call_failed(
                    tool_name.to_string(),
                    "Tool is disabled by configuration".to_string(),
                ));
            }
        }

        let connections = self.connections.load();
        let manager = connections
            .get(&registration.server)
            .ok_or_else(|| RelayError::server_not_connected(registration.server.clone()))?;

        if manager.status().await != ConnectionStatus::Connected {
            return Err(RelayError::server_not_connected(registration.server.clone()));
        }

        let arguments = apply_default_arguments(arguments, tool_override);

        let timeout = tool_override
            .and_then(|o| o.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                let secs = manager.descriptor().timeouts.request_secs;
                if secs == 0 {
                    DEFAULT_CALL_TIMEOUT
                } else {
                    Duration::from_secs(secs)
                }
            });

        debug!(
            "Routing call '{}' to server '{}' (timeout {:?})",
            tool_name, registration.server, timeout
        );

        manager.call(tool_name, arguments, timeout).await
    }

    /// Execute a batch of calls concurrently and independently.
    ///
    /// One call's failure or timeout never cancels or blocks the others;
    /// the returned list parallels the input order.
    pub async fn call_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolCallOutcome> {
        let futures = calls.into_iter().map(|call| async move {
            let started = Instant::now();
            let result = self.call(&call.tool_name, call.arguments.clone()).await;
            ToolCallOutcome {
                id: call.id,
                tool_name: call.tool_name,
                result,
                duration: started.elapsed(),
            }
        });

        join_all(futures).await
    }

    /// Per-server status plus aggregate stats
    pub async fn health_check(&self) -> RouterHealth {
        let connections = self.connections.load();
        let servers = join_all(connections.values().map(|manager| manager.health())).await;

        let connected_servers = servers
            .iter()
            .filter(|h| h.status == ConnectionStatus::Connected)
            .count();

        let mut servers = servers;
        servers.sort_by(|a, b| a.server.cmp(&b.server));

        RouterHealth {
            total_servers: servers.len(),
            connected_servers,
            total_tools: self.registry.len(),
            servers,
        }
    }

    /// Explicitly reconnect one server (the supervising layer calls this on
    /// a stale heartbeat)
    pub async fn reconnect_server(&self, server: &str) -> Result<()> {
        let manager = {
            let connections = self.connections.load();
            connections
                .get(server)
                .cloned()
                .ok_or_else(|| RelayError::server_not_connected(server))?
        };

        manager.reconnect().await?;
        let tools = manager.tools().await;
        self.registry.replace_server_tools(server, tools);
        Ok(())
    }

    /// Disconnect every manager and clear the registry
    pub async fn shutdown(&self) {
        let connections = self.connections.load_full();
        for (name, manager) in connections.iter() {
            if let Err(e) = manager.disconnect().await {
                warn!("Failed to disconnect server '{}': {}", name, e);
            }
            self.registry.remove_server(name);
        }
        self.connections.store(Arc::new(HashMap::new()));
        info!("Router shut down");
    }

    /// Tear down and rebuild managers whose descriptors changed.
    ///
    /// Safe to call concurrently with in-flight calls: the connection map is
    /// swapped atomically, so calls already dispatched complete against the
    /// pre-reload managers; replaced managers are torn down after a drain
    /// grace period of their own request timeout.
    pub async fn reload_config(
        &self,
        descriptors: Vec<ServerDescriptor>,
        overrides: HashMap<String, ToolOverride>,
    ) -> Result<()> {
        let current = self.connections.load_full();
        let mut next: ConnectionMap = HashMap::new();
        let mut to_bring_up: Vec<Arc<ConnectionManager>> = Vec::new();

        for descriptor in descriptors {
            if !descriptor.enabled {
                continue;
            }

            match current.get(&descriptor.name) {
                Some(existing) if *existing.descriptor() == descriptor => {
                    // Unchanged: keep the live manager.
                    next.insert(descriptor.name.clone(), Arc::clone(existing));
                }
                _ => {
                    let manager = Arc::new(ConnectionManager::new(descriptor.clone())?);
                    to_bring_up.push(Arc::clone(&manager));
                    next.insert(descriptor.name, manager);
                }
            }
        }

        join_all(to_bring_up.iter().map(|manager| self.bring_up(Arc::clone(manager)))).await;

        // Swap first: new calls route to the new set while in-flight calls
        // keep their pre-reload managers alive through their own Arcs.
        self.connections.store(Arc::new(next.clone()));
        self.overrides.store(Arc::new(overrides));

        for (name, manager) in current.iter() {
            let replaced = match next.get(name) {
                Some(kept) => !Arc::ptr_eq(kept, manager),
                None => true,
            };
            if replaced {
                self.registry.remove_server(name);
                if let Some(kept) = next.get(name) {
                    // A rebuilt manager re-registers its own tools.
                    self.registry.replace_server_tools(name, kept.tools().await);
                }

                let manager = Arc::clone(manager);
                let grace = Duration::from_secs(manager.descriptor().timeouts.request_secs.max(1));
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Err(e) = manager.disconnect().await {
                        warn!("Failed to tear down replaced server '{}': {}", manager.server_name(), e);
                    }
                });
            }
        }

        info!(
            "Config reloaded: {} servers, {} tools",
            self.connections.load().len(),
            self.registry.len()
        );
        Ok(())
    }
}

/// Merge per-tool default arguments under the caller's arguments
/// (caller-supplied keys win)
fn apply_default_arguments(arguments: Value, tool_override: Option<&ToolOverride>) -> Value {
    let defaults = match tool_override.and_then(|o| o.default_arguments.as_ref()) {
        Some(Value::Object(defaults)) => defaults,
        _ => return arguments,
    };

    match arguments {
        Value::Object(supplied) => {
            let mut merged = defaults.clone();
            for (key, value) in supplied {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        Value::Null => Value::Object(defaults.clone()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RetryPolicy, TimeoutConfig, TransportKind};
    use crate::mcp::clients::{LocalTransport, Transport};
    use serde_json::json;

    fn local_descriptor(name: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            transport: TransportKind::Local,
            url: None,
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
            headers: std::collections::HashMap::new(),
        }
    }

    async fn router_with_echo(server: &str, tool_name: &str) -> ToolRouter {
        let host = LocalTransport::new(server);
        let tool = Tool::new(tool_name, "echo", json!({"type": "object"})).unwrap();
        host.register(tool, |args| Box::pin(async move { Ok(json!({"echo": args})) }))
            .await
            .unwrap();

        let manager = ConnectionManager::with_transport(local_descriptor(server), Transport::Local(host));
        let router = ToolRouter::new();
        router.add_manager(Arc::new(manager)).await;
        router
    }

    #[tokio::test]
    async fn test_unknown_tool_is_hard_error() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        let err = router.call("no_such_tool", json!({})).await.unwrap_err();
        assert_eq!(err.category(), "tool_not_found");
    }

    #[tokio::test]
    async fn test_default_arguments_overlay_caller_wins() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        let overrides = HashMap::from([(
            "fetch_logs".to_string(),
            ToolOverride {
                timeout_secs: None,
                default_arguments: Some(json!({"lines": 200, "format": "plain"})),
                enabled: true,
            },
        )]);
        router.overrides.store(Arc::new(overrides));

        let result = router.call("fetch_logs", json!({"lines": 50})).await.unwrap();
        assert_eq!(result["echo"]["lines"], json!(50));
        assert_eq!(result["echo"]["format"], json!("plain"));
    }

    #[tokio::test]
    async fn test_disabled_tool_rejected() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        let overrides = HashMap::from([(
            "fetch_logs".to_string(),
            ToolOverride {
                timeout_secs: None,
                default_arguments: None,
                enabled: false,
            },
        )]);
        router.overrides.store(Arc::new(overrides));

        let err = router.call("fetch_logs", json!({})).await.unwrap_err();
        assert_eq!(err.category(), "tool_call_failed");
    }

    #[tokio::test]
    async fn test_call_on_disconnected_server_fails() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        {
            let connections = router.connections.load();
            connections["ops-east"].disconnect().await.unwrap();
        }

        let err = router.call("fetch_logs", json!({})).await.unwrap_err();
        assert_eq!(err.category(), "server_not_connected");
    }

    #[tokio::test]
    async fn test_batch_calls_are_independent() {
        let host = LocalTransport::new("ops-east");
        let fast = Tool::new("fast", "fast tool", json!({"type": "object"})).unwrap();
        host.register(fast, |_| Box::pin(async { Ok(json!("fast-result")) }))
            .await
            .unwrap();
        let slow = Tool::new("slow", "slow tool", json!({"type": "object"})).unwrap();
        host.register(slow, |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("slow-result"))
            })
        })
        .await
        .unwrap();

        let manager =
            ConnectionManager::with_transport(local_descriptor("ops-east"), Transport::Local(host));
        let router = ToolRouter::new();
        router.add_manager(Arc::new(manager)).await;

        // Tight timeout on the slow tool only.
        let overrides = HashMap::from([(
            "slow".to_string(),
            ToolOverride {
                timeout_secs: Some(0),
                default_arguments: None,
                enabled: true,
            },
        )]);
        router.overrides.store(Arc::new(overrides));

        let outcomes = router
            .call_batch(vec![
                ToolCall::new("fast", json!({})),
                ToolCall::new("slow", json!({})),
                ToolCall::new("fast", json!({})),
            ])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].error().unwrap().category(), "tool_call_timeout");
        assert!(outcomes[2].is_success());
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!("fast-result"));
    }

    #[tokio::test]
    async fn test_health_check_aggregates() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        let health = router.health_check().await;
        assert_eq!(health.total_servers, 1);
        assert_eq!(health.connected_servers, 1);
        assert_eq!(health.total_tools, 1);
        assert_eq!(health.servers[0].server, "ops-east");
    }

    #[tokio::test]
    async fn test_reload_keeps_unchanged_manager() {
        let router = ToolRouter::new();
        router
            .initialize(vec![local_descriptor("builtin")], HashMap::new())
            .await
            .unwrap();

        let before = Arc::as_ptr(router.connections.load().get("builtin").unwrap());
        router
            .reload_config(vec![local_descriptor("builtin")], HashMap::new())
            .await
            .unwrap();
        let after = Arc::as_ptr(router.connections.load().get("builtin").unwrap());

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_reload_drops_removed_server() {
        let router = router_with_echo("ops-east", "fetch_logs").await;
        assert_eq!(router.list_tools().len(), 1);

        router.reload_config(Vec::new(), HashMap::new()).await.unwrap();
        assert!(router.list_tools().is_empty());
        assert!(router.connections.load().is_empty());
    }
}
