//! The conversational state machine.
//!
//! An [`AgentLoop`] drives one user input to completion through potentially
//! several LLM round-trips: the provider answers either with terminal text or
//! with tool calls, tool calls are dispatched through the registry in order,
//! their results are appended to the log, and the provider is called again.
//! A [`CancelSignal`] is polled cooperatively before every suspension-capable
//! point, and an optional `max_tool_rounds` bound stops runaway tool loops.
//!
//! The loop separates immutable configuration (provider, registry, handler,
//! signal, bound) from the only mutable pieces: the message log and the
//! state.  The log is monotonic — nothing outside this module appends to it,
//! and it is never rewritten, so a cancelled turn leaves partial history a
//! later turn can build on.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wn_core::wn::agent_loop::{AgentLoop, NoopHandler};
//! use wn_core::wn::providers::ollama::OllamaProvider;
//! use wn_core::wn::tool_registry::ToolRegistry;
//!
//! # async {
//! let provider = Arc::new(OllamaProvider::new(None, "llama3.1"));
//! let agent = AgentLoop::new(provider, Arc::new(ToolRegistry::new()), Arc::new(NoopHandler));
//! let answer = agent.step("What is the capital of France?").await?;
//! println!("{}", answer);
//! # Ok::<(), wn_core::wn::error::CoreError>(())
//! # };
//! ```

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::{Message, Provider, TokenUsage, ToolDefinition, ToolResult};
use crate::wn::tool_registry::ToolRegistry;

/// Observable states of an agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No turn in flight.
    Idle,
    /// A multi-turn run is waiting for its next input.
    WaitingInput,
    /// A provider round-trip is in flight.
    Thinking,
    /// A tool is executing.
    ToolRunning,
}

impl AgentState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::WaitingInput => "waiting_input",
            AgentState::Thinking => "thinking",
            AgentState::ToolRunning => "tool_running",
        }
    }
}

/// Callback surface for observing a loop.
///
/// All methods default to no-ops so implementors only override what they
/// care about.  Notifications arrive in the order the transitions actually
/// happen; duplicate transitions to the same state are still notified.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// The loop entered `state`.
    async fn on_state_change(&self, _state: AgentState) {}
    /// The assistant produced text — the final answer of a turn, or the text
    /// accompanying a tool-calling response.
    async fn on_response(&self, _text: &str) {}
    /// A tool is about to execute.
    async fn on_tool_start(&self, _name: &str, _args: &serde_json::Value) {}
    /// A tool finished executing.
    async fn on_tool_end(&self, _name: &str, _result: &ToolResult) {}
    /// A provider failure, streaming failure, or exhausted round bound.
    async fn on_error(&self, _message: &str) {}
    /// The provider reported token usage for one round-trip.
    async fn on_usage(&self, _usage: &TokenUsage) {}
}

/// Handler that ignores every notification.
pub struct NoopHandler;

#[async_trait]
impl AgentHandler for NoopHandler {}

/// Cooperative cancellation flag shared between a loop and its controller.
///
/// Cloning is cheap; all clones observe the same flag.  The signal applies
/// to the current in-flight turn only — the controller resets it once the
/// abort has been observed so later turns start clean.
///
/// Tool executions are polled-only (a long-running tool honors the signal
/// itself if it wants fast cancellation), but the provider round-trip races
/// [`cancelled`](CancelSignal::cancelled) so an abort interrupts a hung
/// upstream request.
#[derive(Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancelSignal {
    /// A fresh, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal, waking anything awaiting [`cancelled`](CancelSignal::cancelled).
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clear the signal so the next turn is unaffected.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal triggers (immediately if it already has).
    pub async fn cancelled(&self) {
        if self.is_triggered() {
            return;
        }
        let mut notified = std::pin::pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// The multi-round LLM ↔ tool state machine.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    handler: Arc<dyn AgentHandler>,
    cancel: CancelSignal,
    max_tool_rounds: Option<usize>,
    messages: Mutex<Vec<Message>>,
    state: std::sync::Mutex<AgentState>,
}

impl AgentLoop {
    /// Create a loop with an empty log and no round bound.
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        handler: Arc<dyn AgentHandler>,
    ) -> Self {
        AgentLoop {
            provider,
            registry,
            handler,
            cancel: CancelSignal::new(),
            max_tool_rounds: None,
            messages: Mutex::new(Vec::new()),
            state: std::sync::Mutex::new(AgentState::Idle),
        }
    }

    /// Seed the log with a system message (builder pattern).
    pub fn with_system_message(self, system: impl Into<Arc<str>>) -> Self {
        let system: Arc<str> = system.into();
        if !system.is_empty() {
            self.messages
                .try_lock()
                .expect("fresh loop is uncontended")
                .push(Message::system(system));
        }
        self
    }

    /// Attach an externally owned cancellation signal (builder pattern).
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = signal;
        self
    }

    /// Bound the number of tool rounds per input (builder pattern).
    ///
    /// Unbounded by default.
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = Some(rounds);
        self
    }

    /// The loop's cancellation signal.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Snapshot of the message log.
    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    /// The current state.
    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock poisoned")
    }

    async fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("state lock poisoned") = state;
        self.handler.on_state_change(state).await;
    }

    /// Materialize the advertised tool list, `None` when the registry is empty.
    fn advertised_tools(&self) -> Option<Vec<ToolDefinition>> {
        let tools: Vec<ToolDefinition> =
            self.registry.list().iter().map(|t| (**t).clone()).collect();
        if tools.is_empty() {
            None
        } else {
            Some(tools)
        }
    }

    /// Drive one user input to a terminal assistant answer.
    ///
    /// Returns the final assistant text, or an error when the provider
    /// failed, the round bound was reached, or the turn was cancelled.  The
    /// log keeps everything appended up to the failure point.
    pub async fn step(&self, input: &str) -> CoreResult<String> {
        if self.cancel.is_triggered() {
            return Err(CoreError::Aborted);
        }

        self.messages.lock().await.push(Message::user(input));

        let tools = self.advertised_tools();
        let mut rounds = 0usize;

        loop {
            if self.cancel.is_triggered() {
                return Err(CoreError::Aborted);
            }

            self.set_state(AgentState::Thinking).await;

            let snapshot = self.messages.lock().await.clone();
            // Race the round-trip against cancellation so an abort
            // interrupts a hung provider; dropping the future abandons the
            // in-flight request.
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CoreError::Aborted),
                outcome = self.provider.complete(&snapshot, tools.as_deref()) => outcome,
            };
            let completion = match outcome {
                Ok(completion) => completion,
                Err(err) => {
                    self.handler.on_error(&err.to_string()).await;
                    self.set_state(AgentState::Idle).await;
                    return Err(err);
                }
            };

            if let Some(usage) = &completion.usage {
                self.handler.on_usage(usage).await;
            }

            if completion.tool_calls.is_empty() {
                self.messages
                    .lock()
                    .await
                    .push(Message::assistant(completion.content.as_str()));
                self.handler.on_response(&completion.content).await;
                self.set_state(AgentState::Idle).await;
                return Ok(completion.content);
            }

            self.messages.lock().await.push(Message::assistant_with_tools(
                completion.content.as_str(),
                completion.tool_calls.clone(),
            ));
            if !completion.content.is_empty() {
                self.handler.on_response(&completion.content).await;
            }

            for call in &completion.tool_calls {
                if self.cancel.is_triggered() {
                    return Err(CoreError::Aborted);
                }

                let Some(tool) = self.registry.get(&call.name) else {
                    // Unknown tool: synthesize a result and keep going so the
                    // model can recover.
                    self.messages.lock().await.push(Message::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        format!("Tool not found: {}", call.name),
                    ));
                    continue;
                };

                self.set_state(AgentState::ToolRunning).await;
                self.handler.on_tool_start(&call.name, &call.arguments).await;

                let result = (tool.execute)(call.arguments.clone()).await;
                self.messages.lock().await.push(Message::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    result.text_for_model(),
                ));
                self.handler.on_tool_end(&call.name, &result).await;
            }

            rounds += 1;
            if let Some(max) = self.max_tool_rounds {
                if rounds >= max {
                    let err = CoreError::MaxToolRounds(max);
                    self.handler.on_error(&err.to_string()).await;
                    self.set_state(AgentState::Idle).await;
                    return Err(err);
                }
            }
        }
    }

    /// Drive a whole session from an input source.
    ///
    /// A `step` that fails does not end the run — one bad turn must not
    /// poison the session — but cancellation does, with `Aborted`.
    pub async fn run<S>(&self, inputs: S) -> CoreResult<()>
    where
        S: Stream<Item = String> + Send,
    {
        self.run_with_hook(inputs, |_| async { false }).await
    }

    /// [`run`](AgentLoop::run) with a per-turn hook; returning `true` stops
    /// the run cleanly.  The hook receives the turn's outcome.
    pub async fn run_with_hook<S, F, Fut>(&self, inputs: S, mut hook: F) -> CoreResult<()>
    where
        S: Stream<Item = String> + Send,
        F: FnMut(CoreResult<String>) -> Fut + Send,
        Fut: std::future::Future<Output = bool> + Send,
    {
        futures_util::pin_mut!(inputs);
        loop {
            if self.cancel.is_triggered() {
                return Err(CoreError::Aborted);
            }
            self.set_state(AgentState::WaitingInput).await;

            let Some(input) = inputs.next().await else {
                break;
            };

            let outcome = self.step(&input).await;
            if let Err(err) = &outcome {
                if err.is_aborted() {
                    return Err(CoreError::Aborted);
                }
            }
            if hook(outcome).await {
                break;
            }
        }
        self.set_state(AgentState::Idle).await;
        Ok(())
    }
}
