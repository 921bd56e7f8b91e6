//! opsrelay - Multi-transport tool client with masked LLM orchestration
//!
//! This crate lets an LLM-driven operations assistant invoke remote
//! administrative tools hosted on heterogeneous backend servers (WebSocket,
//! HTTP, SSE, Stream-HTTP, subprocess or in-process), while guaranteeing
//! that no raw secret-bearing value reaches the external LLM provider in
//! plaintext: tool output is pseudonymized per conversation turn and the
//! streamed answer has its pseudonyms restored on the way out.

pub mod config;
pub mod context;
pub mod error;
pub mod masking;
pub mod mcp;
pub mod orchestrator;
pub mod registry;
pub mod routing;

pub use config::{Config, ServerDescriptor, ToolOverride, TransportKind};
pub use context::RelayContext;
pub use error::{RelayError, Result};
pub use masking::MaskingEngine;
pub use mcp::{ConnectionManager, ConnectionStatus, Tool};
pub use orchestrator::{ChatMessage, OrchestratorEvent, ToolOrchestrator};
pub use routing::{ToolCall, ToolCallOutcome, ToolRouter};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "opsrelay.yaml";

/// Install a default tracing subscriber honoring `RUST_LOG`.
///
/// Intended for the embedding process and integration tests; calling it
/// twice is harmless (the second call is ignored).
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
