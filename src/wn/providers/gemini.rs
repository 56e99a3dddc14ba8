//! Google Gemini adapter speaking the Generative Language API.
//!
//! Gemini separates system priming into `systemInstruction`, renames the
//! assistant role to `model`, and wraps tool schemas in a single
//! `functionDeclarations` group.  Tool calls come back as whole
//! `functionCall` parts — never fragmented — so the streaming path emits a
//! [`StreamChunk::ToolCall`](crate::wn::provider::StreamChunk) the moment a
//! part arrives.  Gemini does not assign call ids; the adapter synthesizes a
//! fresh UUID per call so results can still be correlated in the canonical
//! history.

use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::{
    ChunkStream, Completion, Message, Provider, Role, StreamChunk, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::wn::providers::common::{get_shared_http_client, stream_err};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Adapter for Google's Generative Language (Gemini) API.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    /// Create an adapter from an API key, optional base URL, and model name.
    pub fn new(api_key: &str, base_url: Option<&str>, model: &str) -> Self {
        GeminiProvider {
            api_key: api_key.to_string(),
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
    ) -> serde_json::Value {
        let (contents, system_instruction) = wire_contents(messages);
        let mut body = serde_json::json!({ "contents": contents });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::json!([{
                "functionDeclarations": tools
                    .iter()
                    .map(|t| serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }))
                    .collect::<Vec<_>>(),
            }]);
        }
        body
    }
}

/// Serialise canonical messages into Gemini `contents`, separating the
/// system instruction (joined with `\n` when several system messages exist).
fn wire_contents(messages: &[Message]) -> (Vec<serde_json::Value>, Option<String>) {
    let mut contents = Vec::with_capacity(messages.len());
    let mut system_parts: Vec<&str> = Vec::new();

    for msg in messages {
        if msg.tool_call_id.is_some() {
            let name = msg.name.as_deref().unwrap_or("tool");
            contents.push(serde_json::json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": name,
                        "response": tool_response_value(msg.content.as_ref()),
                    },
                }],
            }));
            continue;
        }
        match msg.role {
            Role::System => system_parts.push(msg.content.as_ref()),
            Role::User => contents.push(serde_json::json!({
                "role": "user",
                "parts": [{ "text": msg.content.as_ref() }],
            })),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(serde_json::json!({ "text": msg.content.as_ref() }));
                }
                for call in &msg.tool_calls {
                    parts.push(serde_json::json!({
                        "functionCall": { "name": call.name, "args": call.arguments },
                    }));
                }
                contents.push(serde_json::json!({ "role": "model", "parts": parts }));
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (contents, system)
}

/// Gemini requires a JSON object as the function response; plain text output
/// is wrapped rather than rejected.
fn tool_response_value(payload: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) if value.is_object() => value,
        _ => serde_json::json!({ "result": payload }),
    }
}

/// Decode one `GenerateContentResponse` (whole response or stream chunk).
fn parse_candidate(parsed: &serde_json::Value) -> (String, Vec<ToolCall>) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    if let Some(parts) = parsed
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                content.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    id: Uuid::new_v4().to_string(),
                    name: call
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("args")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({})),
                });
            }
        }
    }

    (content, tool_calls)
}

fn parse_usage(parsed: &serde_json::Value) -> Option<TokenUsage> {
    let meta = parsed.get("usageMetadata")?;
    Some(TokenUsage {
        input_tokens: meta
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
        output_tokens: meta
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
    })
}

#[async_trait]
impl Provider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = get_shared_http_client()
            .post(&url)
            .json(&self.build_body(messages, tools))
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Provider(format!("Gemini response read failed: {}", e)))?;
        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("GeminiProvider::complete: HTTP {}: {}", status, text);
            }
            return Err(CoreError::Provider(format!(
                "Gemini HTTP {}: {}",
                status, text
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Provider(format!("Gemini decode failed: {}", e)))?;
        if let Some(message) = parsed.pointer("/error/message").and_then(|m| m.as_str()) {
            return Err(CoreError::Provider(format!("Gemini API error: {}", message)));
        }

        let (content, tool_calls) = parse_candidate(&parsed);
        Ok(Completion {
            content,
            tool_calls,
            usage: parse_usage(&parsed),
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let response = get_shared_http_client()
            .post(&url)
            .json(&self.build_body(messages, tools))
            .send()
            .await
            .map_err(|e| CoreError::Provider(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Provider(format!(
                "Gemini HTTP {}: {}",
                status, text
            )));
        }

        let events = response.bytes_stream().eventsource();
        let chunks = stream! {
            let mut usage: Option<TokenUsage> = None;
            futures_util::pin_mut!(events);

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() {
                            continue;
                        }
                        let parsed: serde_json::Value = match serde_json::from_str(data) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        // The last chunk carries the cumulative counts.
                        if let Some(reported) = parse_usage(&parsed) {
                            usage = Some(reported);
                        }
                        let (text, tool_calls) = parse_candidate(&parsed);
                        if !text.is_empty() {
                            yield Ok(StreamChunk::Delta { content: text });
                        }
                        // Whole functionCall parts: emit immediately.
                        for tool_call in tool_calls {
                            yield Ok(StreamChunk::ToolCall { tool_call });
                        }
                    }
                    Err(err) => {
                        yield Err(stream_err(format!("Gemini stream error: {}", err)));
                        return;
                    }
                }
            }

            yield Ok(StreamChunk::Done { usage });
        };

        Ok(Box::pin(chunks))
    }
}
