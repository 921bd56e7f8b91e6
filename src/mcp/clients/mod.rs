//! Transport clients for backend tool servers
//!
//! One variant implementation per transport kind, selected once at
//! construction time from the server descriptor; no runtime type inspection
//! thereafter.

pub mod http;
pub mod local;
pub mod queue;
pub mod sse;
pub mod stream_http;
pub mod subprocess;
pub mod websocket;

pub use http::HttpTransport;
pub use local::{LocalTransport, ToolHandler};
pub use queue::ResponseQueue;
pub use sse::SseTransport;
pub use stream_http::StreamHttpTransport;
pub use subprocess::SubprocessTransport;
pub use websocket::WebSocketTransport;

use crate::config::{ServerDescriptor, TransportKind};
use crate::error::Result;
use crate::mcp::types::Tool;
use serde_json::Value;
use std::time::Duration;

/// Closed polymorphic dispatch over the transport clients
pub enum Transport {
    WebSocket(WebSocketTransport),
    Http(HttpTransport),
    Sse(SseTransport),
    StreamHttp(StreamHttpTransport),
    Subprocess(SubprocessTransport),
    Local(LocalTransport),
}

impl Transport {
    /// Build the transport matching the descriptor's kind.
    ///
    /// A `local` descriptor yields an empty in-process host; embedders
    /// register handlers on it before connecting the manager.
    pub fn from_descriptor(descriptor: &ServerDescriptor) -> Result<Self> {
        Ok(match descriptor.transport {
            TransportKind::Websocket => Transport::WebSocket(WebSocketTransport::new(descriptor)?),
            TransportKind::Http => Transport::Http(HttpTransport::new(descriptor)?),
            TransportKind::Sse => Transport::Sse(SseTransport::new(descriptor)?),
            TransportKind::StreamHttp => Transport::StreamHttp(StreamHttpTransport::new(descriptor)?),
            TransportKind::Subprocess => Transport::Subprocess(SubprocessTransport::new(descriptor)?),
            TransportKind::Local => Transport::Local(LocalTransport::new(descriptor.name.clone())),
        })
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            Transport::WebSocket(client) => client.connect().await,
            Transport::Http(client) => client.connect().await,
            Transport::Sse(client) => client.connect().await,
            Transport::StreamHttp(client) => client.connect().await,
            Transport::Subprocess(client) => client.connect().await,
            Transport::Local(client) => client.connect().await,
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        match self {
            Transport::WebSocket(client) => client.disconnect().await,
            Transport::Http(client) => client.disconnect().await,
            Transport::Sse(client) => client.disconnect().await,
            Transport::StreamHttp(client) => client.disconnect().await,
            Transport::Subprocess(client) => client.disconnect().await,
            Transport::Local(client) => client.disconnect().await,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        match self {
            Transport::WebSocket(client) => client.list_tools().await,
            Transport::Http(client) => client.list_tools().await,
            Transport::Sse(client) => client.list_tools().await,
            Transport::StreamHttp(client) => client.list_tools().await,
            Transport::Subprocess(client) => client.list_tools().await,
            Transport::Local(client) => client.list_tools().await,
        }
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        match self {
            Transport::WebSocket(client) => client.call_tool(tool_name, arguments, timeout).await,
            Transport::Http(client) => client.call_tool(tool_name, arguments, timeout).await,
            Transport::Sse(client) => client.call_tool(tool_name, arguments, timeout).await,
            Transport::StreamHttp(client) => client.call_tool(tool_name, arguments, timeout).await,
            Transport::Subprocess(client) => client.call_tool(tool_name, arguments, timeout).await,
            Transport::Local(client) => client.call_tool(tool_name, arguments, timeout).await,
        }
    }

    pub async fn ping(&self) -> bool {
        match self {
            Transport::WebSocket(client) => client.ping().await,
            Transport::Http(client) => client.ping().await,
            Transport::Sse(client) => client.ping().await,
            Transport::StreamHttp(client) => client.ping().await,
            Transport::Subprocess(client) => client.ping().await,
            Transport::Local(client) => client.ping().await,
        }
    }
}
