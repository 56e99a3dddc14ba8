//! Anthropic Claude adapter speaking the native Messages API.
//!
//! Claude is the system-separated back-end: canonical `system` messages are
//! concatenated with `\n` and sent as the top-level `system` parameter, never
//! inline in the message list.  Assistant turns with tool calls become
//! content-block arrays (`text` + `tool_use`), and tool results travel back
//! as `tool_result` blocks inside a user turn.
//!
//! Streaming uses SSE.  Tool-call arguments arrive as `input_json_delta`
//! fragments keyed by content-block index; the adapter accumulates them per
//! block and emits a single, fully-decoded
//! [`StreamChunk::ToolCall`](crate::wn::provider::StreamChunk) when the
//! block stops.  Usage is split across `message_start` (input tokens) and
//! `message_delta` (output tokens) and is aggregated before the terminal
//! `Done` chunk.

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use std::collections::HashMap;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::{
    ChunkStream, Completion, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::wn::providers::common::{get_shared_http_client, stream_err};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Credential accepted by the Claude adapter.
#[derive(Clone)]
pub enum ClaudeAuth {
    /// Sent as the `x-api-key` header.
    ApiKey(String),
    /// Sent as `Authorization: Bearer`.
    AuthToken(String),
}

/// Adapter for Anthropic's Messages API.
pub struct ClaudeProvider {
    http: reqwest::Client,
    auth: ClaudeAuth,
    base_url: String,
    model: String,
}

impl ClaudeProvider {
    /// Create an adapter from an API key, optional base URL, and model name.
    pub fn new(api_key: &str, base_url: Option<&str>, model: &str) -> Self {
        Self::with_auth(ClaudeAuth::ApiKey(api_key.to_string()), base_url, model)
    }

    /// Create an adapter with an explicit credential kind.
    pub fn with_auth(auth: ClaudeAuth, base_url: Option<&str>, model: &str) -> Self {
        ClaudeProvider {
            http: get_shared_http_client().clone(),
            auth,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        match &self.auth {
            ClaudeAuth::ApiKey(key) => builder.header("x-api-key", key),
            ClaudeAuth::AuthToken(token) => {
                builder.header("Authorization", format!("Bearer {}", token))
            }
        }
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        stream: bool,
    ) -> serde_json::Value {
        let (wire_messages, system) = wire_messages(messages);
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": wire_messages,
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system);
        }
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::Value::Array(wire_tools(tools));
        }
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }
        body
    }
}

/// Serialise canonical messages into the Messages API shape.
///
/// Returns the message array plus the separated system parameter (`None`
/// when the history contains no system messages).
fn wire_messages(messages: &[Message]) -> (Vec<serde_json::Value>, Option<String>) {
    let mut wire = Vec::with_capacity(messages.len());
    let mut system_parts: Vec<&str> = Vec::new();

    for msg in messages {
        if let Some(call_id) = &msg.tool_call_id {
            wire.push(serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": msg.content.as_ref(),
                }],
            }));
            continue;
        }
        match msg.role {
            Role::System => system_parts.push(msg.content.as_ref()),
            Role::User => wire.push(serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref(),
            })),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref(),
                    }));
                } else {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(serde_json::json!({
                            "type": "text",
                            "text": msg.content.as_ref(),
                        }));
                    }
                    for call in &msg.tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    wire.push(serde_json::json!({
                        "role": "assistant",
                        "content": blocks,
                    }));
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (wire, system)
}

fn wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

/// Decode a non-streaming Messages API response.
fn parse_completion(parsed: &serde_json::Value) -> Completion {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    if let Some(blocks) = parsed.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        content.push_str(text);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block
                            .get("input")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({})),
                    });
                }
                _ => {}
            }
        }
    }

    let usage = parsed.get("usage").map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
    });

    Completion {
        content,
        tool_calls,
        usage,
    }
}

#[derive(Default)]
struct ToolBlock {
    id: String,
    name: String,
    partial_json: String,
}

/// Reassembly state machine for the Messages API event stream.
///
/// Tool-use blocks are keyed by the vendor's content-block index; the
/// accumulated argument JSON is parsed on the block's stop event, falling
/// back to an empty object when the fragments do not form valid JSON.
#[derive(Default)]
pub(crate) struct ClaudeStreamAssembler {
    blocks: HashMap<u64, ToolBlock>,
    input_tokens: Option<usize>,
    output_tokens: Option<usize>,
    done: bool,
}

impl ClaudeStreamAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, event: &str, data: &serde_json::Value) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        match event {
            "message_start" => {
                if let Some(n) = data
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.input_tokens = Some(n as usize);
                }
            }
            "content_block_start" => {
                let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if data.pointer("/content_block/type").and_then(|v| v.as_str())
                    == Some("tool_use")
                {
                    self.blocks.insert(
                        index,
                        ToolBlock {
                            id: data
                                .pointer("/content_block/id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: data
                                .pointer("/content_block/name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            partial_json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                match data.pointer("/delta/type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = data.pointer("/delta/text").and_then(|v| v.as_str()) {
                            out.push(StreamChunk::Delta {
                                content: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) =
                            data.pointer("/delta/partial_json").and_then(|v| v.as_str())
                        {
                            if let Some(block) = self.blocks.get_mut(&index) {
                                block.partial_json.push_str(fragment);
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(block) = self.blocks.remove(&index) {
                    let arguments = if block.partial_json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&block.partial_json)
                            .unwrap_or_else(|_| serde_json::json!({}))
                    };
                    out.push(StreamChunk::ToolCall {
                        tool_call: ToolCall {
                            id: block.id,
                            name: block.name,
                            arguments,
                        },
                    });
                }
            }
            "message_delta" => {
                if let Some(n) = data.pointer("/usage/output_tokens").and_then(|v| v.as_u64()) {
                    self.output_tokens = Some(n as usize);
                }
            }
            "message_stop" => {
                out.extend(self.finish());
            }
            _ => {}
        }
        out
    }

    /// Emit the terminal chunk.  Idempotent so a stream that ends without a
    /// `message_stop` event still yields exactly one `Done`.
    pub(crate) fn finish(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let usage = match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
            }),
        };
        vec![StreamChunk::Done { usage }]
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        let body = self.build_body(messages, tools, false);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Claude request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("Claude response read failed: {}", e)))?;
        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("ClaudeProvider::complete: HTTP {}: {}", status, text);
            }
            return Err(CoreError::Provider(format!(
                "Claude HTTP {}: {}",
                status, text
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Provider(format!("Claude decode failed: {}", e)))?;
        Ok(parse_completion(&parsed))
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        let body = self.build_body(messages, tools, true);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Claude request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "Claude HTTP {}: {}",
                status, text
            )));
        }

        let events = response.bytes_stream().eventsource();
        let chunks = stream! {
            let mut assembler = ClaudeStreamAssembler::new();
            futures_util::pin_mut!(events);

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim().is_empty() && event.event != "message_stop" {
                            continue;
                        }
                        let data: serde_json::Value =
                            serde_json::from_str(&event.data).unwrap_or(serde_json::Value::Null);
                        for chunk in assembler.feed(&event.event, &data) {
                            yield Ok(chunk);
                        }
                        if event.event == "message_stop" {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(stream_err(format!("Claude stream error: {}", err)));
                        return;
                    }
                }
            }

            for chunk in assembler.finish() {
                yield Ok(chunk);
            }
        };

        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_separated_and_joined() {
        let (wire, system) = wire_messages(&[
            Message::system("A"),
            Message::system("B"),
            Message::user("hi"),
        ]);
        assert_eq!(system.as_deref(), Some("A\nB"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"], "hi");
    }

    #[test]
    fn tool_history_round_trips_as_blocks() {
        let call = ToolCall {
            id: "X".into(),
            name: "f".into(),
            arguments: serde_json::json!({"k": 1}),
        };
        let (wire, _) = wire_messages(&[
            Message::assistant_with_tools("look", vec![call]),
            Message::tool_result("X", "f", "OK"),
        ]);

        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["id"], "X");
        assert_eq!(blocks[1]["input"]["k"], 1);

        let result_blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(result_blocks[0]["type"], "tool_result");
        assert_eq!(result_blocks[0]["tool_use_id"], "X");
        assert_eq!(result_blocks[0]["content"], "OK");
    }

    #[test]
    fn plain_text_response_parses_with_no_tool_calls() {
        let parsed = serde_json::json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 12, "output_tokens": 3},
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.content, "hello");
        assert!(completion.tool_calls.is_empty());
        assert_eq!(completion.usage.unwrap().input_tokens, 12);
    }

    #[test]
    fn stream_reassembles_fragmented_arguments() {
        let mut asm = ClaudeStreamAssembler::new();
        asm.feed(
            "content_block_start",
            &serde_json::json!({
                "index": 0,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "weather"},
            }),
        );
        asm.feed(
            "content_block_delta",
            &serde_json::json!({
                "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "{\"city\":"},
            }),
        );
        asm.feed(
            "content_block_delta",
            &serde_json::json!({
                "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "\"Tokyo\"}"},
            }),
        );
        let chunks = asm.feed("content_block_stop", &serde_json::json!({"index": 0}));
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.name, "weather");
                assert_eq!(tool_call.arguments, serde_json::json!({"city": "Tokyo"}));
            }
            other => panic!("expected tool call chunk, got {:?}", other),
        }
    }

    #[test]
    fn invalid_argument_json_falls_back_to_empty_object() {
        let mut asm = ClaudeStreamAssembler::new();
        asm.feed(
            "content_block_start",
            &serde_json::json!({
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_2", "name": "f"},
            }),
        );
        asm.feed(
            "content_block_delta",
            &serde_json::json!({
                "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{broken"},
            }),
        );
        let chunks = asm.feed("content_block_stop", &serde_json::json!({"index": 1}));
        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.arguments, serde_json::json!({}));
            }
            other => panic!("expected tool call chunk, got {:?}", other),
        }
    }

    #[test]
    fn usage_split_across_events_is_aggregated_into_one_done() {
        let mut asm = ClaudeStreamAssembler::new();
        asm.feed(
            "message_start",
            &serde_json::json!({"message": {"usage": {"input_tokens": 20}}}),
        );
        asm.feed(
            "message_delta",
            &serde_json::json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}),
        );
        let chunks = asm.feed("message_stop", &serde_json::json!({}));
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::Done { usage } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 20);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("expected done chunk, got {:?}", other),
        }
        // A second finish is a no-op: exactly one Done per stream.
        assert!(asm.finish().is_empty());
    }
}
