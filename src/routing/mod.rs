//! Tool routing across backend servers

mod router;
mod types;

pub use router::ToolRouter;
pub use types::{RouterHealth, ToolCall, ToolCallOutcome};
