use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wn_core::wn::agent_loop::{AgentHandler, AgentLoop, AgentState, CancelSignal};
use wn_core::wn::error::{CoreError, CoreResult};
use wn_core::wn::provider::{
    ChunkStream, Completion, Message, Provider, Role, StreamChunk, ToolCall, ToolDefinition,
    ToolResult,
};
use wn_core::wn::tool_registry::ToolRegistry;

/// Provider that replays a scripted sequence of completions.
struct ScriptedProvider {
    responses: Mutex<VecDeque<CoreResult<Completion>>>,
    fallback: Option<Completion>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(responses: Vec<CoreResult<Completion>>) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            responses: Mutex::new(responses.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answers with the same completion.
    fn repeating(completion: Completion) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(completion),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> CoreResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(completion) => Ok(completion.clone()),
            None => Err(CoreError::Provider("script exhausted".to_string())),
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
        "scripted"
    }
}

/// Handler that records every notification in order.
#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn states(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("state:"))
            .collect()
    }
}

#[async_trait]
impl AgentHandler for RecordingHandler {
    async fn on_state_change(&self, state: AgentState) {
        self.events
            .lock()
            .unwrap()
            .push(format!("state:{}", state.as_str()));
    }

    async fn on_response(&self, text: &str) {
        self.events.lock().unwrap().push(format!("response:{}", text));
    }

    async fn on_tool_start(&self, name: &str, _args: &serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push(format!("tool_start:{}", name));
    }

    async fn on_tool_end(&self, name: &str, result: &ToolResult) {
        self.events
            .lock()
            .unwrap()
            .push(format!("tool_end:{}:{}", name, result.ok));
    }

    async fn on_error(&self, message: &str) {
        self.events.lock().unwrap().push(format!("error:{}", message));
    }
}

fn text_completion(text: &str) -> Completion {
    Completion {
        content: text.to_string(),
        tool_calls: Vec::new(),
        usage: None,
    }
}

fn tool_completion(content: &str, calls: Vec<ToolCall>) -> Completion {
    Completion {
        content: content.to_string(),
        tool_calls: calls,
        usage: None,
    }
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args,
    }
}

/// A registry with an `echo` tool that records how often it ran.
fn echo_registry(invocations: Arc<AtomicUsize>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolDefinition::new(
            "echo",
            "Echoes its arguments",
            serde_json::json!({"type": "object"}),
            Arc::new(move |args| {
                let invocations = invocations.clone();
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    ToolResult::success(args.to_string())
                })
            }),
        ))
        .unwrap();
    registry
}

#[tokio::test]
async fn terminates_without_tools() {
    let provider = ScriptedProvider::new(vec![Ok(text_completion("hello"))]);
    let handler = Arc::new(RecordingHandler::default());
    let agent = AgentLoop::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        handler.clone(),
    );

    let answer = agent.step("hi").await.unwrap();
    assert_eq!(answer, "hello");

    let log = agent.messages().await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(&*log[0].content, "hi");
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(&*log[1].content, "hello");

    assert_eq!(handler.states(), vec!["state:thinking", "state:idle"]);
}

#[tokio::test]
async fn converges_over_multiple_rounds() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_completion(
            "",
            vec![call("c1", "echo", serde_json::json!({"x": 1}))],
        )),
        Ok(text_completion("done")),
    ]);
    let handler = Arc::new(RecordingHandler::default());
    let invocations = Arc::new(AtomicUsize::new(0));
    let agent = AgentLoop::new(
        provider.clone(),
        Arc::new(echo_registry(invocations.clone())),
        handler.clone(),
    );

    let answer = agent.step("go").await.unwrap();
    assert_eq!(answer, "done");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    assert_eq!(
        handler.states(),
        vec![
            "state:thinking",
            "state:tool_running",
            "state:thinking",
            "state:idle",
        ]
    );

    // Both assistant messages are in the log, around the tool result.
    let log = agent.messages().await;
    let roles: Vec<Role> = log.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert!(log[2].is_tool_result());
}

#[tokio::test]
async fn intermediate_text_alongside_tool_calls_is_surfaced() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_completion(
            "checking that now",
            vec![call("c1", "echo", serde_json::json!({}))],
        )),
        Ok(text_completion("done")),
    ]);
    let handler = Arc::new(RecordingHandler::default());
    let agent = AgentLoop::new(
        provider,
        Arc::new(echo_registry(Arc::new(AtomicUsize::new(0)))),
        handler.clone(),
    );

    agent.step("go").await.unwrap();
    let responses: Vec<String> = handler
        .events()
        .into_iter()
        .filter(|e| e.starts_with("response:"))
        .collect();
    assert_eq!(responses, vec!["response:checking that now", "response:done"]);
}

#[tokio::test]
async fn bounded_rounds_stop_the_loop() {
    let provider = ScriptedProvider::repeating(tool_completion(
        "",
        vec![call("c", "echo", serde_json::json!({}))],
    ));
    let handler = Arc::new(RecordingHandler::default());
    let agent = AgentLoop::new(
        provider,
        Arc::new(echo_registry(Arc::new(AtomicUsize::new(0)))),
        handler.clone(),
    )
    .with_max_tool_rounds(3);

    let err = agent.step("go").await.unwrap_err();
    assert!(err.to_string().contains('3'), "got: {}", err);
    assert!(handler
        .events()
        .iter()
        .any(|e| e.starts_with("error:") && e.contains("Max tool rounds")));
}

#[tokio::test]
async fn pre_triggered_signal_aborts_before_the_provider() {
    let provider = ScriptedProvider::new(vec![Ok(text_completion("never"))]);
    let signal = CancelSignal::new();
    signal.trigger();

    let agent = AgentLoop::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        Arc::new(wn_core::wn::agent_loop::NoopHandler),
    )
    .with_cancel_signal(signal);

    let err = agent.step("hi").await.unwrap_err();
    assert_eq!(err.to_string(), "Aborted");
    assert_eq!(provider.call_count(), 0);
    assert!(agent.messages().await.is_empty());
}

#[tokio::test]
async fn cancellation_between_tools_skips_the_rest() {
    let signal = CancelSignal::new();
    let second_ran = Arc::new(AtomicUsize::new(0));

    let mut registry = ToolRegistry::new();
    {
        let signal = signal.clone();
        registry
            .register(ToolDefinition::new(
                "first",
                "Triggers cancellation while running",
                serde_json::json!({"type": "object"}),
                Arc::new(move |_| {
                    let signal = signal.clone();
                    Box::pin(async move {
                        signal.trigger();
                        ToolResult::success("first done")
                    })
                }),
            ))
            .unwrap();
    }
    {
        let second_ran = second_ran.clone();
        registry
            .register(ToolDefinition::new(
                "second",
                "Must not run",
                serde_json::json!({"type": "object"}),
                Arc::new(move |_| {
                    let second_ran = second_ran.clone();
                    Box::pin(async move {
                        second_ran.fetch_add(1, Ordering::SeqCst);
                        ToolResult::success("second done")
                    })
                }),
            ))
            .unwrap();
    }

    let provider = ScriptedProvider::new(vec![Ok(tool_completion(
        "",
        vec![
            call("c1", "first", serde_json::json!({})),
            call("c2", "second", serde_json::json!({})),
        ],
    ))]);

    let agent = AgentLoop::new(
        provider,
        Arc::new(registry),
        Arc::new(wn_core::wn::agent_loop::NoopHandler),
    )
    .with_cancel_signal(signal);

    let err = agent.step("go").await.unwrap_err();
    assert_eq!(err.to_string(), "Aborted");
    assert_eq!(second_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_tool_synthesizes_a_result_and_continues() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_completion(
            "",
            vec![call("c9", "nonexistent", serde_json::json!({}))],
        )),
        Ok(text_completion("recovered")),
    ]);
    let agent = AgentLoop::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        Arc::new(wn_core::wn::agent_loop::NoopHandler),
    );

    let answer = agent.step("go").await.unwrap();
    assert_eq!(answer, "recovered");
    // The provider was called again after the unknown tool.
    assert_eq!(provider.call_count(), 2);

    let log = agent.messages().await;
    let synthesized = log
        .iter()
        .find(|m| m.is_tool_result())
        .expect("tool result in log");
    assert_eq!(&*synthesized.content, "Tool not found: nonexistent");
    assert_eq!(synthesized.tool_call_id.as_deref(), Some("c9"));
}

#[tokio::test]
async fn provider_failure_surfaces_through_on_error() {
    let provider = ScriptedProvider::new(vec![Err(CoreError::Provider(
        "upstream 500".to_string(),
    ))]);
    let handler = Arc::new(RecordingHandler::default());
    let agent = AgentLoop::new(provider, Arc::new(ToolRegistry::new()), handler.clone());

    let err = agent.step("hi").await.unwrap_err();
    assert!(err.to_string().contains("upstream 500"));
    assert!(handler.events().iter().any(|e| e.starts_with("error:")));

    // The log retains the user message for a later retry.
    let log = agent.messages().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].role, Role::User);
}

#[tokio::test]
async fn run_continues_past_failed_turns() {
    let provider = ScriptedProvider::new(vec![
        Err(CoreError::Provider("flaky".to_string())),
        Ok(text_completion("second answer")),
    ]);
    let agent = AgentLoop::new(
        provider,
        Arc::new(ToolRegistry::new()),
        Arc::new(wn_core::wn::agent_loop::NoopHandler),
    );

    let inputs = futures_util::stream::iter(vec!["one".to_string(), "two".to_string()]);
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    {
        let outcomes = outcomes.clone();
        agent
            .run_with_hook(inputs, move |outcome| {
                let outcomes = outcomes.clone();
                async move {
                    outcomes.lock().unwrap().push(outcome.is_ok());
                    false
                }
            })
            .await
            .unwrap();
    }
    assert_eq!(*outcomes.lock().unwrap(), vec![false, true]);
}

#[tokio::test]
async fn run_hook_can_stop_the_session() {
    let provider = ScriptedProvider::repeating(text_completion("ok"));
    let agent = AgentLoop::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        Arc::new(wn_core::wn::agent_loop::NoopHandler),
    );

    let inputs = futures_util::stream::iter(vec![
        "a".to_string(),
        "b".to_string(),
        "c".to_string(),
    ]);
    agent
        .run_with_hook(inputs, |_| async { true })
        .await
        .unwrap();
    assert_eq!(provider.call_count(), 1);
}
