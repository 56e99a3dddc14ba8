//! Ollama adapter for locally hosted models.
//!
//! Ollama speaks a unified role list over `/api/chat` with no authentication
//! and streams newline-delimited JSON rather than SSE, so this adapter runs
//! its byte stream through the shared [`ndjson`](crate::wn::ndjson) parser.
//! Tool calls arrive whole, without ids; the adapter synthesizes a UUID per
//! call.  Usage comes from `prompt_eval_count` / `eval_count` on the final
//! line and is omitted when the server does not report them.

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::ndjson::json_lines;
use crate::wn::provider::{
    ChunkStream, Completion, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::wn::providers::common::{get_shared_http_client, openai_wire_tools, stream_err};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Adapter for an Ollama server's chat API.
pub struct OllamaProvider {
    base_url: String,
    model: String,
}

impl OllamaProvider {
    /// Create an adapter from an optional base URL and model name.
    ///
    /// Ollama requires no credentials; the default base URL targets a local
    /// daemon.
    pub fn new(base_url: Option<&str>, model: &str) -> Self {
        OllamaProvider {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
        }
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": stream,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::Value::Array(openai_wire_tools(tools));
        }
        body
    }
}

/// Serialise canonical messages into Ollama's chat shape.
///
/// Unlike the hosted OpenAI wire format, tool-call arguments stay JSON
/// objects and calls carry no ids; tool results are plain `role: tool`
/// messages.
fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            if msg.tool_call_id.is_some() {
                return serde_json::json!({
                    "role": "tool",
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
                        serde_json::json!({
                            "role": "assistant",
                            "content": msg.content.as_ref(),
                            "tool_calls": msg
                                .tool_calls
                                .iter()
                                .map(|tc| serde_json::json!({
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments,
                                    }
                                }))
                                .collect::<Vec<_>>(),
                        })
                    }
                }
            }
        })
        .collect()
}

/// Pull tool calls out of a response `message`, synthesizing UUID ids.
fn parse_tool_calls(message: &serde_json::Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    Some(ToolCall {
                        id: Uuid::new_v4().to_string(),
                        name: func.get("name")?.as_str()?.to_string(),
                        arguments: func
                            .get("arguments")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage(parsed: &serde_json::Value) -> Option<TokenUsage> {
    let input = parsed.get("prompt_eval_count").and_then(|v| v.as_u64());
    let output = parsed.get("eval_count").and_then(|v| v.as_u64());
    match (input, output) {
        (None, None) => None,
        (input, output) => Some(TokenUsage {
            input_tokens: input.unwrap_or(0) as usize,
            output_tokens: output.unwrap_or(0) as usize,
        }),
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        let url = format!("{}/api/chat", self.base_url);
        let response = get_shared_http_client()
            .post(&url)
            .json(&self.build_body(messages, tools, false))
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("Ollama response read failed: {}", e)))?;
        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("OllamaProvider::complete: HTTP {}: {}", status, text);
            }
            return Err(CoreError::Provider(format!(
                "Ollama HTTP {}: {}",
                status, text
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Provider(format!("Ollama decode failed: {}", e)))?;

        let message = parsed.get("message").cloned().unwrap_or_default();
        Ok(Completion {
            content: message
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string(),
            tool_calls: parse_tool_calls(&message),
            usage: parse_usage(&parsed),
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        let url = format!("{}/api/chat", self.base_url);
        let response = get_shared_http_client()
            .post(&url)
            .json(&self.build_body(messages, tools, true))
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "Ollama HTTP {}: {}",
                status, text
            )));
        }

        let lines = json_lines(response.bytes_stream());
        let chunks = stream! {
            let mut usage: Option<TokenUsage> = None;
            futures_util::pin_mut!(lines);

            while let Some(line) = lines.next().await {
                match line {
                    Ok(parsed) => {
                        if let Some(message) = parsed.get("message") {
                            if let Some(text) =
                                message.get("content").and_then(|c| c.as_str())
                            {
                                if !text.is_empty() {
                                    yield Ok(StreamChunk::Delta {
                                        content: text.to_string(),
                                    });
                                }
                            }
                            for tool_call in parse_tool_calls(message) {
                                yield Ok(StreamChunk::ToolCall { tool_call });
                            }
                        }
                        if let Some(reported) = parse_usage(&parsed) {
                            usage = Some(reported);
                        }
                        if parsed.get("done").and_then(|d| d.as_bool()) == Some(true) {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(stream_err(format!("Ollama stream error: {}", err)));
                        return;
                    }
                }
            }

            yield Ok(StreamChunk::Done { usage });
        };

        Ok(Box::pin(chunks))
    }
}
