//! OpenAI Chat Completions adapter.
//!
//! OpenAI is a unified role-list back-end: system messages stay inline, and
//! assistant tool calls travel as a parallel `tool_calls` array with the
//! arguments re-encoded as a JSON string.
//!
//! Two transports share this adapter.  Plain chat (no tools advertised) goes
//! through the `openai_rust2` SDK.  Requests that advertise tools, and all
//! streaming, use the raw HTTP surface so the adapter can reach the
//! `tool_calls` fragments the SDK does not expose: streamed arguments arrive
//! as string deltas keyed by `tool_calls[i].index` and are reassembled into a
//! single [`StreamChunk::ToolCall`](crate::wn::provider::StreamChunk) per
//! logical call.

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use std::collections::BTreeMap;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::{
    ChunkStream, Completion, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::wn::providers::common::{
    get_shared_http_client, openai_usage, openai_wire_messages, openai_wire_tools, stream_err,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI's Chat Completions API (and compatible deployments).
pub struct OpenAIProvider {
    sdk: openai_rust::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIProvider {
    /// Create an adapter from an API key, optional base URL, and model name.
    pub fn new(api_key: &str, base_url: Option<&str>, model: &str) -> Self {
        let http = get_shared_http_client().clone();
        let sdk = match base_url {
            Some(base) => openai_rust::Client::new_with_client_and_base_url(
                api_key,
                http,
                &format!("{}/", base.trim_end_matches('/')),
            ),
            None => openai_rust::Client::new_with_client(api_key, http),
        };
        OpenAIProvider {
            sdk,
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
        }
    }

    /// Convert canonical messages into the SDK's plain-chat shape.
    ///
    /// Only used on the no-tools path, so tool results degrade to user turns.
    fn sdk_messages(messages: &[Message]) -> Vec<chat::Message> {
        messages
            .iter()
            .map(|msg| chat::Message {
                role: match msg.role {
                    Role::System => "system".to_owned(),
                    Role::User => "user".to_owned(),
                    Role::Assistant => "assistant".to_owned(),
                },
                content: msg.content.to_string(),
            })
            .collect()
    }

    /// Plain chat completion through the SDK, with usage capture.
    async fn complete_plain(&self, messages: &[Message]) -> CoreResult<Completion> {
        let args = chat::ChatArguments::new(&self.model, Self::sdk_messages(messages));
        let response = self
            .sdk
            .create_chat(args, Some("/v1/chat/completions".to_string()))
            .await
            .map_err(|e| {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("OpenAIProvider::complete: API error: {}", e);
                }
                CoreError::Provider(format!("OpenAI request failed: {}", e))
            })?;

        let usage = Some(TokenUsage {
            input_tokens: response.usage.prompt_tokens as usize,
            output_tokens: response.usage.completion_tokens as usize,
        });
        let content = response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Completion {
            content,
            tool_calls: Vec::new(),
            usage,
        })
    }

    /// Chat completion with native tool definitions over raw HTTP.
    async fn complete_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> CoreResult<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": openai_wire_messages(messages),
            "tools": openai_wire_tools(tools),
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = get_shared_http_client()
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("OpenAI response read failed: {}", e)))?;
        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("OpenAIProvider::complete: HTTP {} from {}: {}", status, url, text);
            }
            return Err(CoreError::Provider(format!(
                "OpenAI HTTP {}: {}",
                status, text
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Provider(format!("OpenAI decode failed: {}", e)))?;
        Ok(parse_completion(&parsed))
    }
}

/// Decode a non-streaming chat-completions response.
fn parse_completion(parsed: &serde_json::Value) -> Completion {
    let choice_msg = parsed.pointer("/choices/0/message");

    let content = choice_msg
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = choice_msg
        .and_then(|m| m.get("tool_calls"))
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or_else(|_| serde_json::json!({}));
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Completion {
        content,
        tool_calls,
        usage: openai_usage(parsed),
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembly state machine for the chat-completions SSE stream.
///
/// Fragments are keyed by `tool_calls[i].index`; accumulated calls are
/// emitted once the stream reports completion (the `[DONE]` sentinel or the
/// underlying connection closing), immediately before the terminal `Done`.
#[derive(Default)]
pub(crate) struct OpenAiStreamAssembler {
    calls: BTreeMap<u64, PartialCall>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl OpenAiStreamAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, data: &serde_json::Value) -> Vec<StreamChunk> {
        let mut out = Vec::new();

        if let Some(usage) = openai_usage(data) {
            self.usage = Some(usage);
        }

        let delta = data.pointer("/choices/0/delta");
        if let Some(text) = delta
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            if !text.is_empty() {
                out.push(StreamChunk::Delta {
                    content: text.to_string(),
                });
            }
        }

        if let Some(fragments) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            for fragment in fragments {
                let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                    call.id = id.to_string();
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(|v| v.as_str()) {
                    call.name = name.to_string();
                }
                if let Some(args) = fragment
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                {
                    call.arguments.push_str(args);
                }
            }
        }

        out
    }

    /// Flush accumulated tool calls and emit the terminal chunk.  Idempotent.
    pub(crate) fn finish(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut out = Vec::new();
        for (_, call) in std::mem::take(&mut self.calls) {
            let arguments = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}))
            };
            out.push(StreamChunk::ToolCall {
                tool_call: ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                },
            });
        }
        out.push(StreamChunk::Done { usage: self.usage });
        out
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        match tools.filter(|t| !t.is_empty()) {
            Some(tools) => self.complete_with_tools(messages, tools).await,
            None => self.complete_plain(messages).await,
        }
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": openai_wire_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::Value::Array(openai_wire_tools(tools));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = get_shared_http_client()
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "OpenAI HTTP {}: {}",
                status, text
            )));
        }

        let events = response.bytes_stream().eventsource();
        let chunks = stream! {
            let mut assembler = OpenAiStreamAssembler::new();
            futures_util::pin_mut!(events);

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() {
                            continue;
                        }
                        if data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<serde_json::Value>(data) {
                            Ok(value) => {
                                for chunk in assembler.feed(&value) {
                                    yield Ok(chunk);
                                }
                            }
                            Err(err) => {
                                if log::log_enabled!(log::Level::Warn) {
                                    log::warn!("OpenAI stream: skipping bad event: {}", err);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(stream_err(format!("OpenAI stream error: {}", err)));
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
    fn response_with_tool_calls_decodes_string_arguments() {
        let parsed = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{\"k\":1}"},
                    }],
                },
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2},
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.content, "");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments, serde_json::json!({"k": 1}));
        assert_eq!(completion.usage.unwrap().output_tokens, 2);
    }

    #[test]
    fn plain_text_round_trip_returns_empty_tool_calls() {
        let parsed = serde_json::json!({
            "choices": [{"message": {"content": "that text"}}],
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.content, "that text");
        assert!(completion.tool_calls.is_empty());
        assert!(completion.usage.is_none());
    }

    #[test]
    fn streamed_fragments_reassemble_into_one_call() {
        let mut asm = OpenAiStreamAssembler::new();
        asm.feed(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_9", "function": {"name": "weather", "arguments": "{\"city\":"}},
            ]}}],
        }));
        asm.feed(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Tokyo\"}"}},
            ]}}],
        }));
        let chunks = asm.finish();
        assert_eq!(chunks.len(), 2);
        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.id, "call_9");
                assert_eq!(tool_call.arguments, serde_json::json!({"city": "Tokyo"}));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        assert!(matches!(chunks[1], StreamChunk::Done { .. }));
        // Exactly one Done per stream.
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn bad_accumulated_arguments_become_empty_object() {
        let mut asm = OpenAiStreamAssembler::new();
        asm.feed(&serde_json::json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c", "function": {"name": "f", "arguments": "{nope"}},
            ]}}],
        }));
        let chunks = asm.finish();
        match &chunks[0] {
            StreamChunk::ToolCall { tool_call } => {
                assert_eq!(tool_call.arguments, serde_json::json!({}));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn usage_only_chunk_lands_in_done() {
        let mut asm = OpenAiStreamAssembler::new();
        asm.feed(&serde_json::json!({"choices": [{"delta": {"content": "hi"}}]}));
        asm.feed(&serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 8, "completion_tokens": 1},
        }));
        let chunks = asm.finish();
        match chunks.last().unwrap() {
            StreamChunk::Done { usage } => {
                assert_eq!(usage.unwrap().input_tokens, 8);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }
}
