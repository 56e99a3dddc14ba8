//! Shared utilities used across provider adapters.
//!
//! The helpers in this module are useful when implementing additional
//! back-ends: a tuned [`reqwest`] client with persistent connection pooling,
//! the OpenAI-compatible message/tool serialization shared by the unified
//! role-list adapters, and the error wrapper used by streaming responses.

use lazy_static::lazy_static;
use std::error::Error;
use std::time::Duration;

use crate::wn::provider::{Message, Role, TokenUsage, ToolDefinition};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when many requests are issued to
    /// upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Thin error wrapper used when streaming responses fail mid-flight.
#[derive(Debug, Clone)]
pub struct StreamError(pub String);

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StreamError {}

/// Box a streaming failure for yielding inside a chunk stream.
pub fn stream_err(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(StreamError(message.into()))
}

/// Serialise canonical messages to the OpenAI Chat Completions wire format.
///
/// | Canonical message | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` | `{"role":"user","content":"..."}` |
/// | `User` with `tool_call_id` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
/// | `Assistant` without tool calls | `{"role":"assistant","content":"..."}` |
/// | `Assistant` with tool calls | `{"role":"assistant","content":<text or null>,"tool_calls":[...]}` |
///
/// Tool-call arguments are re-encoded as a JSON string, per the wire format.
pub fn openai_wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            if let Some(call_id) = &msg.tool_call_id {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": msg.content.as_ref(),
                });
            }
            match msg.role {
                Role::System => serde_json::json!({
                    "role": "system",
                    "content": msg.content.as_ref(),
                }),
                Role::User => serde_json::json!({
                    "role": "user",
                    "content": msg.content.as_ref(),
                }),
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        serde_json::json!({
                            "role": "assistant",
                            "content": msg.content.as_ref(),
                        })
                    } else {
                        let tool_calls: Vec<serde_json::Value> = msg
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": serde_json::to_string(&tc.arguments)
                                            .unwrap_or_else(|_| "{}".to_string()),
                                    }
                                })
                            })
                            .collect();
                        let content = if msg.content.is_empty() {
                            serde_json::Value::Null
                        } else {
                            serde_json::Value::String(msg.content.to_string())
                        };
                        serde_json::json!({
                            "role": "assistant",
                            "content": content,
                            "tool_calls": tool_calls,
                        })
                    }
                }
            }
        })
        .collect()
}

/// Serialise tool definitions to the OpenAI `tools` array.
pub fn openai_wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Extract `{prompt_tokens, completion_tokens}`-style usage from a response.
///
/// Returns `None` when the vendor did not report usage (the field is omitted,
/// never zeroed).
pub fn openai_usage(parsed: &serde_json::Value) -> Option<TokenUsage> {
    let usage = parsed.get("usage")?;
    if usage.is_null() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wn::provider::ToolCall;

    #[test]
    fn system_messages_stay_inline() {
        let wire = openai_wire_messages(&[
            Message::system("A"),
            Message::system("B"),
            Message::user("hi"),
        ]);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "B");
        assert_eq!(wire[2]["role"], "user");
    }

    #[test]
    fn tool_call_round_trip_wire_shape() {
        let call = ToolCall {
            id: "X".into(),
            name: "f".into(),
            arguments: serde_json::json!({"k": 1}),
        };
        let wire = openai_wire_messages(&[
            Message::assistant_with_tools("", vec![call]),
            Message::tool_result("X", "f", "OK"),
        ]);

        assert_eq!(wire[0]["role"], "assistant");
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["id"], "X");
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "f");
        // Arguments are re-encoded as a JSON string.
        assert_eq!(
            wire[0]["tool_calls"][0]["function"]["arguments"],
            "{\"k\":1}"
        );

        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "X");
        assert_eq!(wire[1]["content"], "OK");
    }

    #[test]
    fn assistant_text_alongside_tool_calls_is_preserved() {
        let call = ToolCall {
            id: "Y".into(),
            name: "g".into(),
            arguments: serde_json::json!({}),
        };
        let wire = openai_wire_messages(&[Message::assistant_with_tools("let me check", vec![call])]);
        assert_eq!(wire[0]["content"], "let me check");
    }

    #[test]
    fn usage_is_omitted_when_absent() {
        assert_eq!(openai_usage(&serde_json::json!({})), None);
        let reported = openai_usage(&serde_json::json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        }));
        assert_eq!(
            reported,
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 4
            })
        );
    }
}
