//! Client for stdio tool servers.
//!
//! A tool server is a subprocess speaking JSON-RPC 2.0 over its own
//! stdin/stdout, one value per line.  On connect the client performs the
//! `initialize` handshake, announces `notifications/initialized`, and
//! enumerates the server's tools.  Each enumerated tool is wrapped as an
//! ordinary [`ToolDefinition`](crate::wn::provider::ToolDefinition) under
//! the globally unique name `<server>__<tool>`; execution calls back into
//! the server with the original, un-prefixed name.
//!
//! Each connection is single-writer: one request/response exchange at a time
//! holds the I/O lock, and server-initiated notifications arriving in
//! between are skipped.  [`connect_all`] applies the startup asymmetry the
//! runtime wants: individual server failures are accumulated as warnings,
//! but if every configured server failed the whole call fails with the
//! joined diagnostics.

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::wn::config::McpServerSpec;
use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::{ToolDefinition, ToolResult};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// The prefixed name an external tool is registered under.
pub fn prefixed_name(server: &str, tool: &str) -> String {
    format!("{}__{}", server, tool)
}

struct ConnectionIo {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// A live connection to one tool-server subprocess.
pub struct McpConnection {
    name: String,
    child: Mutex<Child>,
    io: Mutex<ConnectionIo>,
    next_id: AtomicI64,
}

/// One tool as enumerated by a server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    /// Un-prefixed tool name.
    pub name: String,
    /// Server-supplied description, empty when absent.
    pub description: String,
    /// Opaque input schema, passed through to the model.
    pub input_schema: serde_json::Value,
}

impl McpConnection {
    /// Spawn the server, run the handshake, and list its tools.
    pub async fn connect(spec: &McpServerSpec) -> CoreResult<(Arc<Self>, Vec<McpToolInfo>)> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(env) = &spec.env {
            command.envs(env);
        }

        let mut child = command.spawn().map_err(|e| {
            CoreError::Tool(format!("{}: failed to spawn {}: {}", spec.name, spec.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Tool(format!("{}: no stdin pipe", spec.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Tool(format!("{}: no stdout pipe", spec.name)))?;

        let connection = Arc::new(McpConnection {
            name: spec.name.clone(),
            child: Mutex::new(child),
            io: Mutex::new(ConnectionIo {
                stdin,
                reader: BufReader::new(stdout),
            }),
            next_id: AtomicI64::new(1),
        });

        connection
            .request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "wn-core",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        connection
            .send_notification("notifications/initialized", serde_json::json!({}))
            .await?;

        let listed = connection
            .request("tools/list", serde_json::json!({}))
            .await?;
        let tools = listed
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tool| {
                        Some(McpToolInfo {
                            name: tool.get("name")?.as_str()?.to_string(),
                            description: tool
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or("")
                                .to_string(),
                            input_schema: tool
                                .get("inputSchema")
                                .cloned()
                                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok((connection, tools))
    }

    /// Server name used as the tool-name prefix.
    pub fn server_name(&self) -> &str {
        &self.name
    }

    async fn send_notification(&self, method: &str, params: serde_json::Value) -> CoreResult<()> {
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string();
        let mut io = self.io.lock().await;
        write_line(&mut io.stdin, &line, &self.name).await
    }

    /// One request/response exchange, skipping interleaved notifications.
    async fn request(&self, method: &str, params: serde_json::Value) -> CoreResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        let mut io = self.io.lock().await;
        write_line(&mut io.stdin, &line, &self.name).await?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = io.reader.read_line(&mut buf).await.map_err(|e| {
                CoreError::Tool(format!("{}: read failed: {}", self.name, e))
            })?;
            if read == 0 {
                return Err(CoreError::Tool(format!(
                    "{}: server closed the connection",
                    self.name
                )));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                continue;
            };
            if value.get("id").and_then(|v| v.as_i64()) != Some(id) {
                continue;
            }
            if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                return Err(CoreError::Tool(format!("{}: {}", self.name, message)));
            }
            return Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null));
        }
    }

    /// Invoke a tool by its original (un-prefixed) name.
    ///
    /// The server's content array is flattened to its first text block
    /// (empty string when absent); `isError` maps to `ok = false`.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> ToolResult {
        let result = self
            .request(
                "tools/call",
                serde_json::json!({
                    "name": name,
                    "arguments": arguments,
                }),
            )
            .await;

        match result {
            Ok(result) => {
                let text = result
                    .get("content")
                    .and_then(|c| c.as_array())
                    .and_then(|blocks| {
                        blocks.iter().find_map(|block| {
                            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                                block.get("text").and_then(|t| t.as_str()).map(String::from)
                            } else {
                                None
                            }
                        })
                    })
                    .unwrap_or_default();
                if result.get("isError").and_then(|e| e.as_bool()) == Some(true) {
                    ToolResult::failure(text)
                } else {
                    ToolResult::success(text)
                }
            }
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }

    /// Kill the server process.  Errors are suppressed; teardown must not
    /// fail teardown.
    pub async fn close(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str, server: &str) -> CoreResult<()> {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'\n');
    stdin
        .write_all(&bytes)
        .await
        .map_err(|e| CoreError::Tool(format!("{}: write failed: {}", server, e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| CoreError::Tool(format!("{}: flush failed: {}", server, e)))
}

/// Wrap a server's tools as registry-ready definitions.
pub fn wrap_tools(connection: Arc<McpConnection>, tools: Vec<McpToolInfo>) -> Vec<ToolDefinition> {
    tools
        .into_iter()
        .map(|info| {
            let connection = connection.clone();
            let original = info.name.clone();
            ToolDefinition::new(
                prefixed_name(connection.server_name(), &info.name),
                info.description,
                info.input_schema,
                Arc::new(move |args| {
                    let connection = connection.clone();
                    let original = original.clone();
                    Box::pin(async move { connection.call_tool(&original, args).await })
                }),
            )
        })
        .collect()
}

/// Every live connection plus the tools and warnings gathered at startup.
pub struct McpConnections {
    /// Surviving connections, for teardown.
    pub connections: Vec<Arc<McpConnection>>,
    /// Registry-ready tool definitions from all surviving servers.
    pub tools: Vec<ToolDefinition>,
    /// One diagnostic per server that failed to connect.
    pub warnings: Vec<String>,
}

impl McpConnections {
    /// An empty set, for configurations without tool servers.
    pub fn empty() -> Self {
        McpConnections {
            connections: Vec::new(),
            tools: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Terminate all surviving connections, suppressing errors.
    pub async fn close_all(&self) {
        for connection in &self.connections {
            connection.close().await;
        }
    }
}

/// Connect every configured server in parallel.
///
/// Some-failed is a success carrying warnings; all-failed is an error with
/// the joined diagnostics.
pub async fn connect_all(specs: &[McpServerSpec]) -> CoreResult<McpConnections> {
    if specs.is_empty() {
        return Ok(McpConnections::empty());
    }

    let attempts = specs.iter().map(McpConnection::connect);
    let results = futures_util::future::join_all(attempts).await;

    let mut connections = Vec::new();
    let mut tools = Vec::new();
    let mut warnings = Vec::new();

    for (spec, result) in specs.iter().zip(results) {
        match result {
            Ok((connection, infos)) => {
                tools.extend(wrap_tools(connection.clone(), infos));
                connections.push(connection);
            }
            Err(err) => {
                warnings.push(format!("{}: {}", spec.name, err));
            }
        }
    }

    if connections.is_empty() {
        return Err(CoreError::Tool(format!(
            "all tool servers failed: {}",
            warnings.join("; ")
        )));
    }

    Ok(McpConnections {
        connections,
        tools,
        warnings,
    })
}
