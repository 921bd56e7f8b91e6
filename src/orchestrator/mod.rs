//! Two-phase LLM/tool orchestration with reversible masking

mod llm;
mod pipeline;
mod types;

pub use llm::{ChatModel, ChunkStream, OpenAiChatModel};
pub use pipeline::ToolOrchestrator;
pub use types::{ChatMessage, Decision, LlmToolCall, OrchestratorEvent, Role};
