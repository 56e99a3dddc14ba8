//! The serve-mode runtime.
//!
//! [`Runtime`] owns everything a running session needs: the root config, the
//! merged resource tables, the tool registry (built-ins, the `agent` tool,
//! and connected external servers), the sub-agent runner, and the current
//! agent loop.  It implements [`RpcHandler`] for the three client methods:
//!
//! - `input { text }` → `{ accepted }` — drives one turn; turns are
//!   serialized behind an internal lock so two inputs never interleave.
//! - `abort {}` → `{ aborted: true }` — triggers the current loop's
//!   cancellation signal.
//! - `configUpdate { persona?, provider?, model? }` → `{ applied }` —
//!   rebuilds the provider and swaps the loop in place.  An in-flight turn
//!   holds its own `Arc` to the old loop and finishes on the provider it
//!   started with; the next `input` sees the new one.  Failures keep the
//!   previous loop and answer `applied: false`.
//!
//! Loop events fan out to the client as `response`, `toolExec`,
//! `stateChange`, and `log` notifications.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::wn::agent_loop::{AgentHandler, AgentLoop, AgentState, CancelSignal};
use crate::wn::config::{ProviderEntry, RootConfig};
use crate::wn::error::{CoreError, CoreResult};
use crate::wn::mcp_client::{self, McpConnections};
use crate::wn::provider::{Provider, TokenUsage, ToolResult};
use crate::wn::providers::make_provider;
use crate::wn::resources::ResourceSet;
use crate::wn::rpc::server::{HandlerError, RpcHandler, RpcNotifier};
use crate::wn::subagent::{agent_tool, SubAgentRunner};
use crate::wn::tool_registry::ToolRegistry;
use crate::wn::tools::register_builtin_tools;

/// Builds a provider from a name, its config entry, and a model.
///
/// Production uses [`make_provider`]; tests inject stub providers here to
/// drive the full server without a network.
pub type ProviderFactory =
    Arc<dyn Fn(&str, &ProviderEntry, &str) -> CoreResult<Arc<dyn Provider>> + Send + Sync>;

/// The active provider/model/persona selection.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Persona name.
    pub persona: String,
}

struct CurrentLoop {
    agent: Arc<AgentLoop>,
    cancel: CancelSignal,
}

/// Fans agent-loop events out as RPC notifications.
struct RpcAgentHandler {
    notifier: RpcNotifier,
}

#[async_trait]
impl AgentHandler for RpcAgentHandler {
    async fn on_state_change(&self, state: AgentState) {
        // waiting_input is a library-level state with no RPC surface.
        if state == AgentState::WaitingInput {
            return;
        }
        self.notifier
            .notify(
                "stateChange",
                Some(serde_json::json!({"state": state.as_str()})),
            )
            .await;
    }

    async fn on_response(&self, text: &str) {
        self.notifier
            .notify("response", Some(serde_json::json!({"content": text})))
            .await;
    }

    async fn on_tool_start(&self, name: &str, args: &Value) {
        self.notifier
            .notify(
                "toolExec",
                Some(serde_json::json!({"event": "start", "name": name, "args": args})),
            )
            .await;
    }

    async fn on_tool_end(&self, name: &str, result: &ToolResult) {
        self.notifier
            .notify(
                "toolExec",
                Some(serde_json::json!({
                    "event": "end",
                    "name": name,
                    "result": {
                        "ok": result.ok,
                        "output": result.output,
                        "error": result.error,
                    },
                })),
            )
            .await;
    }

    async fn on_error(&self, message: &str) {
        self.notifier
            .notify(
                "log",
                Some(serde_json::json!({"level": "error", "message": message})),
            )
            .await;
    }

    async fn on_usage(&self, usage: &TokenUsage) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "usage: input={} output={}",
                usage.input_tokens,
                usage.output_tokens
            );
        }
    }
}

/// Everything a running `serve` session owns.
pub struct Runtime {
    config: RootConfig,
    resources: Arc<ResourceSet>,
    registry: Arc<ToolRegistry>,
    notifier: RpcNotifier,
    runner: Arc<SubAgentRunner>,
    connections: McpConnections,
    factory: ProviderFactory,
    selection: std::sync::Mutex<Selection>,
    current: RwLock<CurrentLoop>,
    turn_lock: Mutex<()>,
}

impl Runtime {
    /// Assemble a runtime: registry, external connections, sub-agent runner,
    /// and the initial agent loop.
    ///
    /// `provider`/`model`/`persona` are the CLI overrides; `None` falls back
    /// to the config defaults.  An explicitly requested persona that does
    /// not exist is a startup error; a missing *default* persona just means
    /// an empty system message.
    pub async fn build(
        config: RootConfig,
        resources: ResourceSet,
        notifier: RpcNotifier,
        provider: Option<String>,
        model: Option<String>,
        persona: Option<String>,
    ) -> CoreResult<Arc<Runtime>> {
        let factory: ProviderFactory = Arc::new(|name, entry, model| make_provider(name, entry, model));
        Self::build_with_factory(config, resources, notifier, provider, model, persona, factory)
            .await
    }

    /// [`build`](Runtime::build) with an injectable provider factory.
    pub async fn build_with_factory(
        config: RootConfig,
        resources: ResourceSet,
        notifier: RpcNotifier,
        provider: Option<String>,
        model: Option<String>,
        persona: Option<String>,
        factory: ProviderFactory,
    ) -> CoreResult<Arc<Runtime>> {
        let resources = Arc::new(resources);
        let runner = Arc::new(SubAgentRunner::new(config.clone(), resources.clone()));

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry)?;
        registry.register(agent_tool(runner.clone()))?;

        let connections = mcp_client::connect_all(&config.tool_servers()).await?;
        for warning in &connections.warnings {
            log::warn!("tool server: {}", warning);
        }
        for tool in connections.tools.clone() {
            registry.register_external(tool)?;
        }
        let registry = Arc::new(registry);

        let persona_explicit = persona.is_some();
        let selection = Selection {
            provider: provider.unwrap_or_else(|| config.default_provider.clone()),
            model: model.unwrap_or_else(|| config.default_model.clone()),
            persona: persona.unwrap_or_else(|| config.default_persona.clone()),
        };

        let initial = build_loop_parts(
            &config,
            &resources,
            &registry,
            &notifier,
            &factory,
            &selection,
            persona_explicit,
        )?;

        Ok(Arc::new(Runtime {
            current: RwLock::new(initial),
            config,
            resources,
            registry,
            notifier,
            runner,
            connections,
            factory,
            selection: std::sync::Mutex::new(selection),
            turn_lock: Mutex::new(()),
        }))
    }

    /// The sub-agent runner (shared with the `agent` tool).
    pub fn runner(&self) -> Arc<SubAgentRunner> {
        self.runner.clone()
    }

    /// The active selection.
    pub fn selection(&self) -> Selection {
        self.selection.lock().expect("selection lock poisoned").clone()
    }

    /// Trigger the current loop's cancellation signal.
    pub async fn abort(&self) {
        self.current.read().await.cancel.trigger();
    }

    /// Close external tool connections (teardown).
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
    }

    fn build_loop(&self, selection: &Selection, persona_explicit: bool) -> CoreResult<CurrentLoop> {
        build_loop_parts(
            &self.config,
            &self.resources,
            &self.registry,
            &self.notifier,
            &self.factory,
            selection,
            persona_explicit,
        )
    }

    async fn handle_input(&self, params: Option<Value>) -> Result<Value, HandlerError> {
        let text = params
            .as_ref()
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                HandlerError::InvalidParams("input requires a 'text' string".to_string())
            })?
            .to_string();

        // One turn at a time; later inputs queue here in arrival order.
        let _turn = self.turn_lock.lock().await;

        // Snapshot the current loop; a configUpdate during this turn swaps
        // the runtime's loop but not this one.
        let (agent, cancel) = {
            let current = self.current.read().await;
            (current.agent.clone(), current.cancel.clone())
        };

        let outcome = agent.step(&text).await;
        let accepted = outcome.is_ok();
        if let Err(err) = &outcome {
            if err.is_aborted() {
                // The abort consumed this turn; let the next one start clean.
                cancel.reset();
            }
        }
        Ok(serde_json::json!({"accepted": accepted}))
    }

    async fn handle_config_update(&self, params: Option<Value>) -> Result<Value, HandlerError> {
        let params = params.unwrap_or(Value::Null);
        let provider = params.get("provider").and_then(|v| v.as_str());
        let model = params.get("model").and_then(|v| v.as_str());
        let persona = params.get("persona").and_then(|v| v.as_str());

        if provider.is_none() && model.is_none() && persona.is_none() {
            return Ok(serde_json::json!({"applied": false}));
        }

        let mut selection = self.selection();
        if let Some(provider) = provider {
            selection.provider = provider.to_string();
        }
        if let Some(model) = model {
            selection.model = model.to_string();
        }
        if let Some(persona) = persona {
            selection.persona = persona.to_string();
        }

        match self.build_loop(&selection, persona.is_some()) {
            Ok(rebuilt) => {
                *self.current.write().await = rebuilt;
                *self.selection.lock().expect("selection lock poisoned") = selection;
                Ok(serde_json::json!({"applied": true}))
            }
            Err(err) => {
                log::warn!("configUpdate rejected: {}", err);
                self.notifier
                    .notify(
                        "log",
                        Some(serde_json::json!({
                            "level": "warn",
                            "message": format!("configUpdate rejected: {}", err),
                        })),
                    )
                    .await;
                Ok(serde_json::json!({"applied": false}))
            }
        }
    }
}

fn build_loop_parts(
    config: &RootConfig,
    resources: &Arc<ResourceSet>,
    registry: &Arc<ToolRegistry>,
    notifier: &RpcNotifier,
    factory: &ProviderFactory,
    selection: &Selection,
    persona_explicit: bool,
) -> CoreResult<CurrentLoop> {
    let entry = config
        .providers
        .get(&selection.provider)
        .cloned()
        .unwrap_or_default();
    let provider = factory(&selection.provider, &entry, &selection.model)?;

    let system = match resources.persona(&selection.persona) {
        Some(persona) => persona.content.clone(),
        None if persona_explicit => {
            return Err(CoreError::Config(format!(
                "Persona not found: {}",
                selection.persona
            )));
        }
        None => String::new(),
    };

    let cancel = CancelSignal::new();
    let agent = Arc::new(
        AgentLoop::new(
            provider,
            registry.clone(),
            Arc::new(RpcAgentHandler {
                notifier: notifier.clone(),
            }),
        )
        .with_system_message(system.as_str())
        .with_cancel_signal(cancel.clone()),
    );
    Ok(CurrentLoop { agent, cancel })
}

#[async_trait]
impl RpcHandler for Runtime {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError> {
        match method {
            "input" => self.handle_input(params).await,
            "abort" => {
                self.abort().await;
                Ok(serde_json::json!({"aborted": true}))
            }
            "configUpdate" => self.handle_config_update(params).await,
            other => Err(HandlerError::MethodNotFound(other.to_string())),
        }
    }
}
