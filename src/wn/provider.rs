//! Shared primitives for provider-agnostic LLM back-ends.
//!
//! The runtime talks to every vendor through the [`Provider`] trait and the
//! canonical data types in this module.  The trait abstracts over concrete
//! wire formats while the supporting structs describe chat messages, native
//! tool calls, streaming chunks, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wn_core::wn::provider::{Message, Provider};
//! use wn_core::wn::providers::claude::ClaudeProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("ANTHROPIC_API_KEY")?;
//!     let provider = ClaudeProvider::new(&key, None, "claude-sonnet-4-20250514");
//!
//!     let completion = provider
//!         .complete(&[Message::user("Who are you?")], None)
//!         .await?;
//!
//!     println!("Assistant: {}", completion.content);
//!     Ok(())
//! }
//! ```
//!
//! # Streaming quick start
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use wn_core::wn::provider::{Message, Provider, StreamChunk};
//! use wn_core::wn::providers::claude::ClaudeProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("ANTHROPIC_API_KEY")?;
//!     let provider = ClaudeProvider::new(&key, None, "claude-sonnet-4-20250514");
//!
//!     let mut chunks = provider
//!         .stream(&[Message::user("Explain Rust lifetimes in a sentence.")], None)
//!         .await?;
//!     while let Some(chunk) = chunks.next().await {
//!         if let StreamChunk::Delta { content } = chunk? {
//!             print!("{}", content);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::wn::error::CoreResult;

/// Represents the possible roles for a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message, or a tool result fed back to the model.
    User,
    /// An assistant authored message (model responses, possibly with tool calls).
    Assistant,
}

/// A single tool call requested by the LLM in a native function-calling response.
///
/// Providers assign an opaque [`id`](ToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up tool-result message.
/// Back-ends that do not report ids get a fresh UUID from the adapter.
///
/// # Example
///
/// ```rust
/// use wn_core::wn::provider::ToolCall;
///
/// let tc = ToolCall {
///     id: "call_abc123".to_string(),
///     name: "calculator".to_string(),
///     arguments: serde_json::json!({"expression": "2 + 2"}),
/// };
/// assert_eq!(tc.name, "calculator");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned (or adapter-synthesized) call ID.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Decoded JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Represents a generic message in the conversation log.
///
/// `tool_calls` is non-empty only on assistant messages that requested tools.
/// `tool_call_id` marks the message as a tool's output being fed back to the
/// model; the provider adapter re-tags it to the vendor's tool-result role.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.  Stored as `Arc<str>` so the log can be cheaply
    /// cloned into provider requests.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant.
    pub tool_calls: Vec<ToolCall>,
    /// When set, this message carries the output of the referenced tool call.
    pub tool_call_id: Option<String>,
    /// Tool name carried alongside `tool_call_id` for vendors that require it.
    pub name: Option<String>,
}

impl Message {
    /// A system message.
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// An ordinary user message.
    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// A plain assistant text message.
    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// An assistant message carrying tool calls, with possibly-empty text.
    pub fn assistant_with_tools(content: impl Into<Arc<str>>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// A tool result bound to the originating call id, fed back as a user turn.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            role: Role::User,
            content: output.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// True when this message is a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.tool_call_id.is_some()
    }
}

/// The textual outcome of executing a tool.
///
/// `output` is what the model sees; on failure it is empty and `error` carries
/// the diagnostic.  Tool execution never raises — validation and runtime
/// failures both come back as `ok: false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Whether the tool execution succeeded.
    pub ok: bool,
    /// Textual output for the model (empty string on pure error).
    pub output: String,
    /// Diagnostic string when `ok` is false.
    pub error: Option<String>,
}

impl ToolResult {
    /// Convenience constructor for successful execution.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error: None,
        }
    }

    /// Convenience constructor for failed execution.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// The text that gets threaded back into the conversation.
    pub fn text_for_model(&self) -> &str {
        if self.ok {
            &self.output
        } else {
            self.error.as_deref().unwrap_or("")
        }
    }
}

/// Future returned by a tool's execute function.
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolResult> + Send>>;

/// The async function object behind a tool.
///
/// Takes the decoded argument mapping; may perform I/O and be long-running.
/// Cancellation is cooperative via the agent loop's signal.
pub type ToolExecuteFn = Arc<dyn Fn(serde_json::Value) -> ToolFuture + Send + Sync>;

/// A named callable advertised to the model.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Tool name as advertised to the model.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON-Schema-shaped object describing the accepted parameters.
    pub parameters: serde_json::Value,
    /// The execution function.  Validation failures are returned as failed
    /// [`ToolResult`]s, never raised.
    pub execute: ToolExecuteFn,
}

impl ToolDefinition {
    /// Create a tool definition from its parts.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        execute: ToolExecuteFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            execute,
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
}

/// A chunk of an incremental provider response.
///
/// Every stream yields exactly one [`StreamChunk::Done`] and it is the last
/// chunk.  `ToolCall` chunks carry fully reassembled arguments — the adapter
/// owns the per-block accumulation of vendor-specific fragments.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// An incremental text fragment.
    Delta {
        /// The text delta.
        content: String,
    },
    /// A complete, reassembled tool call.
    ToolCall {
        /// The call with fully-accumulated arguments.
        tool_call: ToolCall,
    },
    /// Terminal chunk, with token usage when the vendor reported it.
    Done {
        /// Aggregated usage, absent when the vendor does not report it.
        usage: Option<TokenUsage>,
    },
}

/// The uniform result of one LLM round-trip.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Assistant text (may be empty when only tool calls were returned).
    pub content: String,
    /// Native tool calls requested by the model, in order.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when the vendor reported it.
    pub usage: Option<TokenUsage>,
}

/// Type alias for a stream of chunks compatible with `Send` executors.
///
/// Errors during streaming are raised here, at the consumer's iteration
/// point, rather than returned from [`Provider::stream`].
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait-driven abstraction over a single LLM back-end.
///
/// A [`Provider`] translates the canonical message list and tool definitions
/// into the vendor's wire format, for both the request/response and the
/// incremental streaming mode.  Implementations must be thread-safe
/// (`Send + Sync`) so they can be shared between async tasks; conversation
/// bookkeeping lives in the agent loop, never here.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One LLM round-trip over the full message history.
    ///
    /// `tools` carries the definitions advertised to the model; `None` or an
    /// empty slice means tool calling is not offered for this request.  Any
    /// transport or decode failure comes back as a `CoreError::Provider`.
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion>;

    /// Same semantics as [`complete`](Provider::complete), incrementally.
    ///
    /// Setup failures (connect, non-2xx status) are returned from this call;
    /// mid-stream failures surface as `Err` items while iterating the stream.
    async fn stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream>;

    /// The identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}
