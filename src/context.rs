//! Application context
//!
//! One explicitly-constructed object wires configuration to the router, the
//! masking engine and the orchestrator, and is passed by handle to whatever
//! needs it — there is no hidden global state anywhere in the crate. The
//! (excluded) process bootstrap builds one of these at start; tests build
//! their own.

use crate::config::Config;
use crate::error::Result;
use crate::masking::MaskingEngine;
use crate::orchestrator::{ChatModel, ToolOrchestrator};
use crate::routing::{RouterHealth, ToolRouter};
use std::sync::Arc;
use tracing::info;

/// Shared handles to the relay core
pub struct RelayContext {
    router: Arc<ToolRouter>,
    masking: Arc<MaskingEngine>,
    reaper: tokio::task::JoinHandle<()>,
}

impl RelayContext {
    /// Build the core from configuration: connect every enabled server,
    /// publish discovered tools and start the masking-session reaper.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(ToolRouter::new());
        router
            .initialize(config.servers.clone(), config.tool_overrides.clone())
            .await?;

        let masking = Arc::new(MaskingEngine::new(&config.masking));
        let reaper = Arc::clone(masking.sessions()).spawn_reaper();

        info!("Relay context ready");
        Ok(Self {
            router,
            masking,
            reaper,
        })
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn masking(&self) -> &Arc<MaskingEngine> {
        &self.masking
    }

    /// Build an orchestrator bound to this context's router and engine
    pub fn orchestrator(&self, model: Arc<dyn ChatModel>) -> ToolOrchestrator {
        ToolOrchestrator::new(Arc::clone(&self.router), Arc::clone(&self.masking), model)
    }

    /// Per-server status plus aggregate stats
    pub async fn health_check(&self) -> RouterHealth {
        self.router.health_check().await
    }

    /// Apply a reloaded configuration without restarting: managers whose
    /// descriptors changed are rebuilt; in-flight calls complete against the
    /// pre-reload set.
    pub async fn reload_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.router
            .reload_config(config.servers, config.tool_overrides)
            .await
    }

    /// Disconnect every server and stop background work
    pub async fn shutdown(self) {
        self.router.shutdown().await;
        self.reaper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MaskingConfig, ServerDescriptor, TimeoutConfig, TransportKind};

    fn config_with_local(name: &str) -> Config {
        Config {
            servers: vec![ServerDescriptor {
                name: name.to_string(),
                transport: TransportKind::Local,
                url: None,
                command: None,
                args: Vec::new(),
                env: None,
                cwd: None,
                timeouts: TimeoutConfig::default(),
                retry: Default::default(),
                enabled: true,
                enabled_tools: None,
                disabled_tools: None,
                auth: Default::default(),
                headers: Default::default(),
            }],
            tool_overrides: Default::default(),
            masking: MaskingConfig::default(),
            llm: None,
        }
    }

    #[tokio::test]
    async fn test_context_lifecycle() {
        let context = RelayContext::from_config(config_with_local("builtin")).await.unwrap();

        let health = context.health_check().await;
        assert_eq!(health.total_servers, 1);
        assert_eq!(health.connected_servers, 1);

        context.reload_config(config_with_local("builtin")).await.unwrap();
        context.shutdown().await;
    }
}
