// src/lib.rs

// Import the top-level `wn` module.
pub mod wn;

// Re-exporting key items for easier external access.
pub use wn::agent_loop::{AgentHandler, AgentLoop, AgentState, CancelSignal, NoopHandler};
pub use wn::error::{CoreError, CoreResult};
pub use wn::provider::{Message, Provider, Role, StreamChunk, TokenUsage, ToolCall, ToolResult};
pub use wn::tool_registry::ToolRegistry;
