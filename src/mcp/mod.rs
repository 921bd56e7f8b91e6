//! Tool-protocol implementation: wire types, transport clients and the
//! per-server connection manager

pub mod clients;
pub mod connection;
pub mod types;

pub use connection::{ConnectionManager, ConnectionStatus};
pub use types::{McpError, McpRequest, McpResponse, Tool};
