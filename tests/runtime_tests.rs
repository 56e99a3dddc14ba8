//! End-to-end scenarios: the full RPC server and runtime over an in-memory
//! transport, with stub providers injected through the provider factory.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use wn_core::wn::config::RootConfig;
use wn_core::wn::error::{CoreError, CoreResult};
use wn_core::wn::provider::{
    ChunkStream, Completion, Message, Provider, StreamChunk, ToolCall, ToolDefinition,
};
use wn_core::wn::resources::ResourceSet;
use wn_core::wn::rpc::server::{RpcHandler, RpcNotifier, RpcServer};
use wn_core::wn::runtime::{ProviderFactory, Runtime};

/// Provider that always answers with the same text.
struct TextProvider {
    text: String,
}

#[async_trait]
impl Provider for TextProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        Ok(Completion {
            content: self.text.clone(),
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(
            StreamChunk::Done { usage: None },
        )])))
    }

    fn model_name(&self) -> &str {
        "text-stub"
    }
}

/// Provider that requests one `read_file` call, then answers "done".
struct ToolOnceProvider {
    path: String,
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for ToolOnceProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Completion {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".to_string(),
                    name: "read_file".to_string(),
                    arguments: serde_json::json!({"path": self.path}),
                }],
                usage: None,
            })
        } else {
            Ok(Completion {
                content: "done".to_string(),
                tool_calls: Vec::new(),
                usage: None,
            })
        }
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(
            StreamChunk::Done { usage: None },
        )])))
    }

    fn model_name(&self) -> &str {
        "tool-stub"
    }
}

/// Provider that hangs until cancelled.
struct SleepyProvider;

#[async_trait]
impl Provider for SleepyProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Completion {
            content: "too late".to_string(),
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<ChunkStream> {
        Err(CoreError::Provider("no stream".to_string()))
    }

    fn model_name(&self) -> &str {
        "sleepy-stub"
    }
}

struct Client {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
}

impl Client {
    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_value(&mut self) -> Value {
        let mut line = String::new();
        let read =
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a server line")
                .unwrap();
        assert!(read > 0, "server closed the stream");
        serde_json::from_str(line.trim()).unwrap()
    }

    /// Read lines until the response for `id` arrives; returns everything.
    async fn read_until_response(&mut self, id: i64) -> Vec<Value> {
        let mut lines = Vec::new();
        loop {
            let value = self.read_value().await;
            let is_response = value.get("id").map(|v| v == &Value::from(id)).unwrap_or(false);
            lines.push(value);
            if is_response {
                return lines;
            }
        }
    }
}

async fn start_runtime(factory: ProviderFactory) -> Client {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    let notifier = RpcNotifier::new(server_write);

    let runtime = Runtime::build_with_factory(
        RootConfig::default(),
        ResourceSet::new(),
        notifier.clone(),
        None,
        None,
        None,
        factory,
    )
    .await
    .unwrap();

    let mut server = RpcServer::new(
        BufReader::new(server_read),
        notifier,
        runtime.clone() as Arc<dyn RpcHandler>,
    );
    tokio::spawn(async move {
        server.start().await;
    });

    let (client_read, client_write) = tokio::io::split(client_side);
    Client {
        writer: client_write,
        reader: BufReader::new(client_read),
    }
}

fn request(id: i64, method: &str, params: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

#[tokio::test]
async fn input_round_trip_notifies_state_and_response() {
    let factory: ProviderFactory = Arc::new(|_, _, _| {
        Ok(Arc::new(TextProvider {
            text: "hello".to_string(),
        }))
    });
    let mut client = start_runtime(factory).await;

    client.send(request(1, "input", serde_json::json!({"text": "hi"}))).await;
    let lines = client.read_until_response(1).await;

    let summary: Vec<String> = lines
        .iter()
        .map(|v| {
            if let Some(method) = v.get("method").and_then(|m| m.as_str()) {
                match method {
                    "stateChange" => format!("state:{}", v["params"]["state"].as_str().unwrap()),
                    "response" => format!("response:{}", v["params"]["content"].as_str().unwrap()),
                    other => other.to_string(),
                }
            } else {
                format!("result:{}", v["result"]["accepted"])
            }
        })
        .collect();

    assert_eq!(
        summary,
        vec!["state:thinking", "response:hello", "state:idle", "result:true"]
    );
}

#[tokio::test]
async fn tool_calls_fan_out_as_tool_exec_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("p.txt");
    std::fs::write(&path, "file body").unwrap();
    let path_str = path.to_string_lossy().to_string();

    let factory: ProviderFactory = Arc::new(move |_, _, _| {
        Ok(Arc::new(ToolOnceProvider {
            path: path_str.clone(),
            calls: AtomicUsize::new(0),
        }))
    });
    let mut client = start_runtime(factory).await;

    client.send(request(1, "input", serde_json::json!({"text": "read it"}))).await;
    let lines = client.read_until_response(1).await;

    let summary: Vec<String> = lines
        .iter()
        .map(|v| {
            if let Some(method) = v.get("method").and_then(|m| m.as_str()) {
                match method {
                    "stateChange" => format!("state:{}", v["params"]["state"].as_str().unwrap()),
                    "response" => format!("response:{}", v["params"]["content"].as_str().unwrap()),
                    "toolExec" => format!(
                        "tool:{}:{}",
                        v["params"]["event"].as_str().unwrap(),
                        v["params"]["name"].as_str().unwrap()
                    ),
                    other => other.to_string(),
                }
            } else {
                format!("result:{}", v["result"]["accepted"])
            }
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            "state:thinking",
            "state:tool_running",
            "tool:start:read_file",
            "tool:end:read_file",
            "state:thinking",
            "response:done",
            "state:idle",
            "result:true",
        ]
    );

    // The tool's end notification carried the file contents.
    let end = lines
        .iter()
        .find(|v| v.get("method").and_then(|m| m.as_str()) == Some("toolExec")
            && v["params"]["event"] == "end")
        .unwrap();
    assert_eq!(end["params"]["result"]["ok"], true);
    assert_eq!(end["params"]["result"]["output"], "file body");
}

#[tokio::test]
async fn abort_interrupts_a_sleeping_provider() {
    let factory: ProviderFactory = Arc::new(|_, _, _| Ok(Arc::new(SleepyProvider)));
    let mut client = start_runtime(factory).await;

    client.send(request(1, "input", serde_json::json!({"text": "zzz"}))).await;
    // Wait for the turn to be visibly in flight before aborting.
    let first = client.read_value().await;
    assert_eq!(first["params"]["state"], "thinking");

    client.send(request(2, "abort", serde_json::json!({}))).await;

    // Both responses arrive; the tasks race for the writer, so accept
    // either order.
    let mut replies = vec![client.read_value().await, client.read_value().await];
    replies.sort_by_key(|v| v["id"].as_i64());
    assert_eq!(replies[0]["id"], 1);
    assert_eq!(replies[0]["result"]["accepted"], false);
    assert_eq!(replies[1]["id"], 2);
    assert_eq!(replies[1]["result"]["aborted"], true);

    // The signal was reset: the next input runs (and hangs) instead of
    // aborting immediately, so abort it again and expect the same outcome.
    client.send(request(3, "input", serde_json::json!({"text": "again"}))).await;
    let state = client.read_value().await;
    assert_eq!(state["params"]["state"], "thinking");
    client.send(request(4, "abort", serde_json::json!({}))).await;
    let lines = client.read_until_response(3).await;
    let reply = lines.last().unwrap();
    assert_eq!(reply["result"]["accepted"], false);
}

#[tokio::test]
async fn config_update_swaps_the_provider_for_later_inputs() {
    let factory: ProviderFactory = Arc::new(|name, _, _| match name {
        "claude" => Ok(Arc::new(TextProvider {
            text: format!("from-{}", name),
        }) as Arc<dyn Provider>),
        "stub" => Ok(Arc::new(TextProvider {
            text: "from-stub".to_string(),
        }) as Arc<dyn Provider>),
        other => Err(CoreError::Config(format!("unknown provider: {}", other))),
    });

    // The default selection is "claude"; it resolves through the factory.
    let mut client = start_runtime(factory).await;

    // Unknown provider: not applied, previous loop preserved.
    client
        .send(request(1, "configUpdate", serde_json::json!({"provider": "unknown"})))
        .await;
    let lines = client.read_until_response(1).await;
    assert_eq!(lines.last().unwrap()["result"]["applied"], false);

    client.send(request(2, "input", serde_json::json!({"text": "x"}))).await;
    let lines = client.read_until_response(2).await;
    let response = lines
        .iter()
        .find(|v| v.get("method").and_then(|m| m.as_str()) == Some("response"))
        .unwrap();
    assert_eq!(response["params"]["content"], "from-claude");

    // Valid update: applied, and later inputs use the new provider.
    client
        .send(request(
            3,
            "configUpdate",
            serde_json::json!({"provider": "stub", "model": "m"}),
        ))
        .await;
    let lines = client.read_until_response(3).await;
    assert_eq!(lines.last().unwrap()["result"]["applied"], true);

    client.send(request(4, "input", serde_json::json!({"text": "y"}))).await;
    let lines = client.read_until_response(4).await;
    let response = lines
        .iter()
        .find(|v| v.get("method").and_then(|m| m.as_str()) == Some("response"))
        .unwrap();
    assert_eq!(response["params"]["content"], "from-stub");
}

#[tokio::test]
async fn empty_config_update_is_not_applied() {
    let factory: ProviderFactory = Arc::new(|_, _, _| {
        Ok(Arc::new(TextProvider {
            text: "t".to_string(),
        }))
    });
    let mut client = start_runtime(factory).await;

    client.send(request(1, "configUpdate", serde_json::json!({}))).await;
    let lines = client.read_until_response(1).await;
    assert_eq!(lines.last().unwrap()["result"]["applied"], false);
}

#[tokio::test]
async fn missing_text_is_an_invalid_params_error() {
    let factory: ProviderFactory = Arc::new(|_, _, _| {
        Ok(Arc::new(TextProvider {
            text: "t".to_string(),
        }))
    });
    let mut client = start_runtime(factory).await;

    client.send(request(1, "input", serde_json::json!({}))).await;
    let lines = client.read_until_response(1).await;
    assert_eq!(lines.last().unwrap()["error"]["code"], -32602);
}
