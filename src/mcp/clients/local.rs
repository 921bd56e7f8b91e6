//! In-process transport
//!
//! Hosts tools implemented as async closures inside the current process.
//! Embedders register handlers programmatically; the router treats the host
//! like any other server.

use crate::error::{RelayError, Result};
use crate::mcp::types::Tool;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Async handler backing one local tool
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// In-process tool host
#[derive(Clone)]
pub struct LocalTransport {
    /// Server name for identification
    server_name: String,
    /// Registered tools and their handlers
    tools: Arc<RwLock<HashMap<String, (Tool, ToolHandler)>>>,
}

impl LocalTransport {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a tool with its handler, replacing any previous registration
    pub async fn register<F>(&self, tool: Tool, handler: F) -> Result<()>
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        tool.validate()?;
        debug!("Registering local tool '{}' on '{}'", tool.name, self.server_name);
        let mut tools = self.tools.write().await;
        tools.insert(tool.name.clone(), (tool, Arc::new(handler)));
        Ok(())
    }

    pub async fn connect(&self) -> Result<()> {
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let tools = self.tools.read().await;
        Ok(tools.values().map(|(tool, _)| tool.clone()).collect())
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout_dur: Duration) -> Result<Value> {
        let handler = {
            let tools = self.tools.read().await;
            tools
                .get(tool_name)
                .map(|(_, handler)| Arc::clone(handler))
                .ok_or_else(|| RelayError::tool_not_found(tool_name))?
        };

        match timeout(timeout_dur, handler(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::tool_call_timeout(tool_name, timeout_dur.as_secs())),
        }
    }

    pub async fn ping(&self) -> bool {
        true
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}
