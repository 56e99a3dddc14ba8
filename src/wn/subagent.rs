//! Sub-agent resolution, spawning, and tracking.
//!
//! A sub-agent is an isolated agent loop running in its own worker process:
//! the runner re-executes the current binary with the hidden `agent-worker`
//! subcommand, hands it a resolved [`WorkerPayload`] on stdin, and reads
//! NDJSON worker messages back from its stdout.  The payload is a plain
//! record of strings and lists, so nothing but data crosses the process
//! boundary.
//!
//! The worker sends exactly one terminal message — `result` on success,
//! `error` on any failure — plus any number of observational `log` records.
//! Handle transitions:
//!
//! - `result` ⇒ `completed` with the final text,
//! - `error` ⇒ `failed` with the diagnostic,
//! - worker exit with a non-zero code while still `running` ⇒ `failed`,
//! - worker exit with code 0 ⇒ status unchanged (the message is
//!   authoritative).
//!
//! Resolution failures (`Persona not found`, `Skill not found`,
//! `Provider not found`) produce terminal `failed` handles without starting
//! a worker at all.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::wn::agent_loop::{AgentLoop, NoopHandler};
use crate::wn::config::{McpServerSpec, ProviderEntry, RootConfig};
use crate::wn::mcp_client;
use crate::wn::provider::{ToolDefinition, ToolResult};
use crate::wn::providers::make_provider;
use crate::wn::resources::ResourceSet;
use crate::wn::tool_registry::ToolRegistry;
use crate::wn::tools::register_builtin_tools;

/// Observable status of a spawned sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    /// Worker started, no terminal message yet.
    Running,
    /// Worker reported a final result.
    Completed,
    /// Resolution failed, the worker errored, or it was stopped.
    Failed,
}

/// The runner's observable state for one sub-agent.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentHandle {
    /// Random UUID, matching the worker payload id.
    pub id: String,
    /// Current status.
    pub status: SubAgentStatus,
    /// Final text or error string, set on terminal transition.
    pub result: Option<String>,
}

/// Caller-facing spawn parameters.
#[derive(Debug, Clone, Default)]
pub struct SubAgentConfig {
    /// Persona name; the root default applies when absent.
    pub persona: Option<String>,
    /// Skill names, resolved to their bodies.
    pub skills: Vec<String>,
    /// Provider name; the root default applies when absent.
    pub provider: Option<String>,
    /// Model; the root default applies when absent.
    pub model: Option<String>,
    /// The task handed to the worker's single `step`.
    pub task: String,
}

/// Everything a worker needs, serialized across the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    /// Handle id.
    pub id: String,
    /// The single input the worker will step on.
    pub task: String,
    /// Persona content plus `\n\n`-joined skill bodies.
    pub system_message: String,
    /// Provider name for the worker-side factory.
    pub provider_name: String,
    /// Credentials for the worker-side factory.
    pub provider_config: ProviderEntry,
    /// Model name.
    pub model: String,
    /// Tool-server specs the worker connects on its own.
    pub tool_server_configs: Vec<McpServerSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerMessage {
    Result { data: String },
    Error { error: String },
    Log { level: String, message: String },
}

/// Spawns and tracks sub-agent workers.
pub struct SubAgentRunner {
    config: RootConfig,
    resources: Arc<ResourceSet>,
    handles: Mutex<HashMap<String, SubAgentHandle>>,
    kills: Mutex<HashMap<String, Arc<Notify>>>,
}

impl SubAgentRunner {
    /// Create a runner over the root configuration and resource tables.
    pub fn new(config: RootConfig, resources: Arc<ResourceSet>) -> Self {
        SubAgentRunner {
            config,
            resources,
            handles: Mutex::new(HashMap::new()),
            kills: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and spawn a sub-agent; returns the handle immediately.
    ///
    /// Resolution failures produce a terminal `failed` handle and never
    /// start a worker.
    pub fn spawn(self: &Arc<Self>, config: SubAgentConfig) -> SubAgentHandle {
        let id = Uuid::new_v4().to_string();

        let payload = match self.resolve(&id, &config) {
            Ok(payload) => payload,
            Err(message) => {
                let handle = SubAgentHandle {
                    id: id.clone(),
                    status: SubAgentStatus::Failed,
                    result: Some(message),
                };
                self.handles.lock().unwrap().insert(id, handle.clone());
                return handle;
            }
        };

        let handle = SubAgentHandle {
            id: id.clone(),
            status: SubAgentStatus::Running,
            result: None,
        };
        self.handles.lock().unwrap().insert(id.clone(), handle.clone());

        match self.start_worker(&payload) {
            Ok(child) => {
                let kill = Arc::new(Notify::new());
                self.kills.lock().unwrap().insert(id.clone(), kill.clone());
                let runner = self.clone();
                tokio::spawn(async move {
                    runner.monitor(id, child, kill).await;
                });
                handle
            }
            Err(message) => {
                let failed = SubAgentHandle {
                    id: id.clone(),
                    status: SubAgentStatus::Failed,
                    result: Some(message),
                };
                self.handles.lock().unwrap().insert(id, failed.clone());
                failed
            }
        }
    }

    /// Spawn from a named agent definition, applying inline overrides.
    pub fn spawn_named(
        self: &Arc<Self>,
        agent_name: &str,
        task: String,
        overrides: SubAgentConfig,
    ) -> Result<SubAgentHandle, String> {
        let Some(definition) = self.resources.agent(agent_name) else {
            return Err(format!("Agent not found: {}", agent_name));
        };
        let config = SubAgentConfig {
            persona: overrides.persona.or_else(|| definition.persona.clone()),
            skills: if overrides.skills.is_empty() {
                definition.skills.clone()
            } else {
                overrides.skills
            },
            provider: overrides.provider.or_else(|| definition.provider.clone()),
            model: overrides.model.or_else(|| definition.model.clone()),
            task,
        };
        Ok(self.spawn(config))
    }

    /// Forcibly terminate a worker; unknown ids are no-ops.
    pub fn stop(&self, id: &str) {
        if let Some(kill) = self.kills.lock().unwrap().get(id) {
            // notify_one stores a permit, so a monitor that has not reached
            // its select yet still observes the kill.
            kill.notify_one();
        }
    }

    /// Snapshot of all handles, running and terminal.
    pub fn list(&self) -> Vec<SubAgentHandle> {
        let mut handles: Vec<SubAgentHandle> =
            self.handles.lock().unwrap().values().cloned().collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Look one handle up.
    pub fn get(&self, id: &str) -> Option<SubAgentHandle> {
        self.handles.lock().unwrap().get(id).cloned()
    }

    fn resolve(&self, id: &str, config: &SubAgentConfig) -> Result<WorkerPayload, String> {
        let persona_name = config
            .persona
            .as_deref()
            .unwrap_or(&self.config.default_persona);
        let Some(persona) = self.resources.persona(persona_name) else {
            return Err(format!("Persona not found: {}", persona_name));
        };

        let mut skill_bodies = Vec::with_capacity(config.skills.len());
        for skill_name in &config.skills {
            let Some(skill) = self.resources.skill(skill_name) else {
                return Err(format!("Skill not found: {}", skill_name));
            };
            // The system message is built from skill bodies, not names.
            skill_bodies.push(skill.body.clone());
        }

        let provider_name = config
            .provider
            .as_deref()
            .unwrap_or(&self.config.default_provider);
        let Some(provider_config) = self.config.providers.get(provider_name) else {
            return Err(format!("Provider not found: {}", provider_name));
        };

        let system_message = if skill_bodies.is_empty() {
            persona.content.clone()
        } else {
            format!("{}\n\n{}", persona.content, skill_bodies.join("\n\n"))
        };

        Ok(WorkerPayload {
            id: id.to_string(),
            task: config.task.clone(),
            system_message,
            provider_name: provider_name.to_string(),
            provider_config: provider_config.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            tool_server_configs: self.config.tool_servers(),
        })
    }

    fn start_worker(&self, payload: &WorkerPayload) -> Result<Child, String> {
        let exe = std::env::current_exe()
            .map_err(|e| format!("cannot locate current executable: {}", e))?;
        let mut child = Command::new(exe)
            .arg("agent-worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot spawn worker: {}", e))?;

        let encoded = serde_json::to_string(payload)
            .map_err(|e| format!("cannot encode worker payload: {}", e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| "worker has no stdin pipe".to_string())?;
        tokio::spawn(async move {
            let mut bytes = encoded.into_bytes();
            bytes.push(b'\n');
            let _ = stdin.write_all(&bytes).await;
            // Dropping stdin closes the pipe so the worker sees EOF.
        });

        Ok(child)
    }

    fn set_handle(&self, id: &str, status: SubAgentStatus, result: Option<String>) {
        if let Some(handle) = self.handles.lock().unwrap().get_mut(id) {
            handle.status = status;
            handle.result = result;
        }
    }

    fn status_of(&self, id: &str) -> Option<SubAgentStatus> {
        self.handles.lock().unwrap().get(id).map(|h| h.status)
    }

    fn apply_message(&self, id: &str, line: &str) {
        match serde_json::from_str::<WorkerMessage>(line) {
            Ok(WorkerMessage::Result { data }) => {
                self.set_handle(id, SubAgentStatus::Completed, Some(data));
            }
            Ok(WorkerMessage::Error { error }) => {
                self.set_handle(id, SubAgentStatus::Failed, Some(error));
            }
            Ok(WorkerMessage::Log { level, message }) => match level.as_str() {
                "error" => log::error!("sub-agent {}: {}", id, message),
                "warn" => log::warn!("sub-agent {}: {}", id, message),
                _ => log::info!("sub-agent {}: {}", id, message),
            },
            // Unrecognized shapes are ignored for forward compatibility.
            Err(_) => {}
        }
    }

    async fn monitor(self: Arc<Self>, id: String, mut child: Child, kill: Arc<Notify>) {
        let stdout = child.stdout.take();
        let mut lines = stdout.map(|s| BufReader::new(s).lines());

        if let Some(lines) = lines.as_mut() {
            loop {
                tokio::select! {
                    _ = kill.notified() => {
                        let _ = child.kill().await;
                        self.set_handle(&id, SubAgentStatus::Failed, Some("stopped".to_string()));
                        self.kills.lock().unwrap().remove(&id);
                        return;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => self.apply_message(&id, line.trim()),
                        _ => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = kill.notified() => {
                let _ = child.kill().await;
                self.set_handle(&id, SubAgentStatus::Failed, Some("stopped".to_string()));
                self.kills.lock().unwrap().remove(&id);
                return;
            }
            status = child.wait() => status,
        };
        self.kills.lock().unwrap().remove(&id);

        match status {
            Ok(status) if status.success() => {
                // Zero exit: the worker's own message is authoritative.
            }
            Ok(status) => {
                if self.status_of(&id) == Some(SubAgentStatus::Running) {
                    self.set_handle(
                        &id,
                        SubAgentStatus::Failed,
                        Some(format!(
                            "worker exited with code {}",
                            status.code().unwrap_or(-1)
                        )),
                    );
                }
            }
            Err(err) => {
                if self.status_of(&id) == Some(SubAgentStatus::Running) {
                    self.set_handle(
                        &id,
                        SubAgentStatus::Failed,
                        Some(format!("worker wait failed: {}", err)),
                    );
                }
            }
        }
    }
}

/// Worker-side entrypoint behind the hidden `agent-worker` subcommand.
///
/// Reads the payload from stdin, builds its own provider and registry,
/// runs one `step` with no observable handler, and reports the outcome as a
/// single NDJSON message on stdout.
pub async fn agent_worker_main() -> i32 {
    let mut payload_line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if stdin.read_line(&mut payload_line).await.is_err() {
        emit(&serde_json::json!({"type": "error", "error": "cannot read worker payload"}));
        return 1;
    }
    let payload: WorkerPayload = match serde_json::from_str(payload_line.trim()) {
        Ok(payload) => payload,
        Err(err) => {
            emit(&serde_json::json!({
                "type": "error",
                "error": format!("invalid worker payload: {}", err),
            }));
            return 1;
        }
    };

    let provider = match make_provider(
        &payload.provider_name,
        &payload.provider_config,
        &payload.model,
    ) {
        Ok(provider) => provider,
        Err(err) => {
            emit(&serde_json::json!({"type": "error", "error": err.to_string()}));
            return 0;
        }
    };

    let mut registry = ToolRegistry::new();
    if let Err(err) = register_builtin_tools(&mut registry) {
        emit(&serde_json::json!({"type": "error", "error": err.to_string()}));
        return 0;
    }

    let connections = match mcp_client::connect_all(&payload.tool_server_configs).await {
        Ok(connections) => {
            for warning in &connections.warnings {
                emit(&serde_json::json!({
                    "type": "log",
                    "level": "warn",
                    "message": warning,
                }));
            }
            for tool in connections.tools.clone() {
                if let Err(err) = registry.register_external(tool) {
                    emit(&serde_json::json!({
                        "type": "log",
                        "level": "warn",
                        "message": err.to_string(),
                    }));
                }
            }
            connections
        }
        Err(err) => {
            emit(&serde_json::json!({"type": "error", "error": err.to_string()}));
            return 0;
        }
    };

    let agent = AgentLoop::new(provider, Arc::new(registry), Arc::new(NoopHandler))
        .with_system_message(payload.system_message.as_str());

    let outcome = agent.step(&payload.task).await;
    connections.close_all().await;

    match outcome {
        Ok(text) => {
            emit(&serde_json::json!({"type": "result", "data": text}));
            0
        }
        Err(err) => {
            emit(&serde_json::json!({"type": "error", "error": err.to_string()}));
            0
        }
    }
}

fn emit(message: &serde_json::Value) {
    println!("{}", message);
}

/// The built-in `agent` tool: spawn, inspect, and list sub-agents.
pub fn agent_tool(runner: Arc<SubAgentRunner>) -> ToolDefinition {
    ToolDefinition::new(
        "agent",
        "Spawn isolated sub-agents and inspect their status. \
         Actions: spawn (requires task, optional agent/persona/skills/provider/model), \
         status (requires id), list.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["spawn", "status", "list"]},
                "task": {"type": "string", "description": "Task for the sub-agent (spawn)"},
                "agent": {"type": "string", "description": "Named agent definition (spawn)"},
                "persona": {"type": "string"},
                "skills": {"type": "array", "items": {"type": "string"}},
                "provider": {"type": "string"},
                "model": {"type": "string"},
                "id": {"type": "string", "description": "Handle id (status)"},
            },
            "required": ["action"],
        }),
        Arc::new(move |args| {
            let runner = runner.clone();
            Box::pin(async move {
                let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
                match action {
                    "spawn" => {
                        let Some(task) = args.get("task").and_then(|t| t.as_str()) else {
                            return ToolResult::failure("spawn requires a 'task' argument");
                        };
                        let overrides = SubAgentConfig {
                            persona: string_arg(&args, "persona"),
                            skills: string_list_arg(&args, "skills"),
                            provider: string_arg(&args, "provider"),
                            model: string_arg(&args, "model"),
                            task: task.to_string(),
                        };
                        let handle = match args.get("agent").and_then(|a| a.as_str()) {
                            Some(agent_name) => {
                                match runner.spawn_named(agent_name, task.to_string(), overrides) {
                                    Ok(handle) => handle,
                                    Err(message) => return ToolResult::failure(message),
                                }
                            }
                            None => runner.spawn(overrides),
                        };
                        ToolResult::success(
                            serde_json::to_string(&handle).unwrap_or_default(),
                        )
                    }
                    "status" => {
                        let Some(id) = args.get("id").and_then(|i| i.as_str()) else {
                            return ToolResult::failure("status requires an 'id' argument");
                        };
                        match runner.get(id) {
                            Some(handle) => ToolResult::success(
                                serde_json::to_string(&handle).unwrap_or_default(),
                            ),
                            None => ToolResult::failure(format!("no such sub-agent: {}", id)),
                        }
                    }
                    "list" => ToolResult::success(
                        serde_json::to_string(&runner.list()).unwrap_or_default(),
                    ),
                    other => ToolResult::failure(format!("unknown action: {}", other)),
                }
            })
        }),
    )
}

fn string_arg(args: &serde_json::Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn string_list_arg(args: &serde_json::Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
