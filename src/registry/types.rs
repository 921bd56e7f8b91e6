//! Flat name → owning-server registry of discovered tools
//!
//! Tool names are global keys across the aggregate. On a cross-server name
//! collision the last registration wins; this is given behavior, logged at
//! WARN (see DESIGN.md).

use crate::mcp::types::Tool;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

/// One registered tool and the server that owns it
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub tool: Tool,
    /// Owning server name; resolves the call at dispatch time
    pub server: String,
    pub discovered_at: DateTime<Utc>,
}

/// Concurrent aggregate registry of discovered tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a server's registrations wholesale with a fresh discovery.
    ///
    /// Tools the server no longer publishes are dropped; entries this server
    /// lost to a later registration by another server are left alone.
    pub fn replace_server_tools(&self, server: &str, tools: Vec<Tool>) {
        self.tools.retain(|_, entry| entry.server != server);

        let now = Utc::now();
        for tool in tools {
            if let Some(existing) = self.tools.get(&tool.name) {
                warn!(
                    "Tool name collision: '{}' from server '{}' replaces the one from '{}' (last discovery wins)",
                    tool.name, server, existing.server
                );
            }
            debug!("Registering tool '{}' from server '{}'", tool.name, server);
            self.tools.insert(
                tool.name.clone(),
                RegisteredTool {
                    tool,
                    server: server.to_string(),
                    discovered_at: now,
                },
            );
        }
    }

    /// Drop every registration owned by a server (disconnect/reload path)
    pub fn remove_server(&self, server: &str) {
        self.tools.retain(|_, entry| entry.server != server);
    }

    /// Resolve a tool name to its registration
    pub fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).map(|entry| entry.clone())
    }

    /// Snapshot of every registered tool
    pub fn list(&self) -> Vec<RegisteredTool> {
        let mut tools: Vec<RegisteredTool> = self.tools.iter().map(|entry| entry.clone()).collect();
        tools.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool::new(name, "test tool", json!({"type": "object"})).unwrap()
    }

    #[test]
    fn test_replace_is_wholesale() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("ops-east", vec![tool("a"), tool("b")]);
        assert_eq!(registry.len(), 2);

        registry.replace_server_tools("ops-east", vec![tool("b"), tool("c")]);
        let names: Vec<String> = registry.list().into_iter().map(|r| r.tool.name).collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_collision_last_discovery_wins() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("ops-east", vec![tool("fetch_logs")]);
        registry.replace_server_tools("ops-west", vec![tool("fetch_logs")]);

        let entry = registry.lookup("fetch_logs").unwrap();
        assert_eq!(entry.server, "ops-west");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_server_leaves_other_owners() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("ops-east", vec![tool("a")]);
        registry.replace_server_tools("ops-west", vec![tool("b")]);

        registry.remove_server("ops-east");
        assert!(registry.lookup("a").is_none());
        assert!(registry.lookup("b").is_some());
    }

    #[test]
    fn test_rediscovery_does_not_reclaim_lost_name() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("ops-east", vec![tool("fetch_logs"), tool("east_only")]);
        registry.replace_server_tools("ops-west", vec![tool("fetch_logs")]);

        // ops-east rediscovers without fetch_logs: the west entry survives.
        registry.replace_server_tools("ops-east", vec![tool("east_only")]);
        assert_eq!(registry.lookup("fetch_logs").unwrap().server, "ops-west");
    }
}
