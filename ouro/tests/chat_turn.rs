//! Chat turn glue: context assembly, serialized tool loop, persistence.

mod init_logging;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ouro::chat::ChatTurn;
use ouro::memory::MemoryEngine;
use ouro::message::Role;
use ouro::pipeline::{
    BreakerSettings, CircuitBreaker, Executor, ExecutorFailure, ParamSchema, ParamSpec,
    RateLimiter, SecurityPolicy, ToolPipeline, ToolRegistry, ToolSpec,
};
use ouro::runtime::{ApiKey, ChainEntry, Dispatcher, MockProvider, Provider};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct LookupExecutor;

#[async_trait]
impl Executor for LookupExecutor {
    async fn run(
        &self,
        args: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExecutorFailure> {
        Ok(json!({"matches": [args["query"].as_str().unwrap_or_default()]}))
    }
}

fn pipeline() -> Arc<ToolPipeline> {
    let registry = ToolRegistry::builder()
        .register(
            ToolSpec::new(
                "code_search",
                "searches the indexed code",
                "memory",
                ParamSchema::new()
                    .property("query", ParamSpec::string())
                    .require("query"),
            ),
            Arc::new(LookupExecutor),
        )
        .build();
    Arc::new(ToolPipeline::new(
        Arc::new(registry),
        SecurityPolicy::new("/tmp/ouro-chat-test", &[]),
        RateLimiter::new(HashMap::new()),
        CircuitBreaker::new(BreakerSettings::default(), HashMap::new()),
    ))
}

fn wiring(dir: &std::path::Path, mock: Arc<MockProvider>) -> ChatTurn {
    let memory = Arc::new(
        MemoryEngine::open_at(dir.join("memory.db"), dir.join("conversations"), 100).unwrap(),
    );
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .provider(mock as Arc<dyn Provider>)
            .keys("mock", vec![ApiKey::new("k1", "s")])
            .chain(vec![ChainEntry::new("mock", "m")])
            .build(),
    );
    ChatTurn::new(memory, dispatcher, pipeline())
}

/// **Scenario**: a plain reply persists user + assistant messages in order
/// and returns the reply.
#[tokio::test]
async fn simple_turn_persists_both_sides() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new("mock"));
    mock.push(ouro::runtime::MockOutcome::Succeed("hello back".into()));
    let turn = wiring(dir.path(), Arc::clone(&mock));

    let outcome = turn
        .run("conv1", "hello there", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.reply.as_deref(), Some("hello back"));
    assert_eq!(outcome.rounds, 1);
    assert!(!outcome.cancelled);

    let content = std::fs::read_to_string(dir.path().join("conversations/conv1.jsonl")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"user\""));
    assert!(lines[1].contains("hello back"));
}

/// **Scenario**: a tool-calling response runs the tool through the pipeline,
/// persists the `tool` message with the wire-shaped outcome, then loops for
/// the final reply.
#[tokio::test]
async fn tool_calls_are_executed_and_persisted_in_order() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(ToolCallingMock::new());
    let memory = Arc::new(
        MemoryEngine::open_at(
            dir.path().join("memory.db"),
            dir.path().join("conversations"),
            100,
        )
        .unwrap(),
    );
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .provider(Arc::clone(&mock) as Arc<dyn Provider>)
            .keys("toolmock", vec![ApiKey::new("k1", "s")])
            .chain(vec![ChainEntry::new("toolmock", "m")])
            .build(),
    );
    let turn = ChatTurn::new(Arc::clone(&memory), dispatcher, pipeline());

    let outcome = turn
        .run("conv2", "find the auth code", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.reply.as_deref(), Some("found it"));
    assert_eq!(outcome.rounds, 2);

    let messages = memory.list_messages("conv2", 20).await.unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );

    let tool_msg = &messages[2];
    let wire: serde_json::Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(wire["ok"], true);
    assert_eq!(wire["result"]["matches"][0], "auth");
    assert_eq!(tool_msg.metadata.as_ref().unwrap()["tool_name"], "code_search");
}

/// **Scenario**: cancelling mid-turn returns a marked outcome; messages
/// persisted before the cancel remain.
#[tokio::test]
async fn cancellation_is_marked_and_keeps_persisted_messages() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new("mock"));
    let turn = wiring(dir.path(), Arc::clone(&mock));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = turn.run("conv3", "hello", &cancel).await.unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.reply.is_none());

    // The user message was persisted before cancellation stopped the turn.
    let content = std::fs::read_to_string(dir.path().join("conversations/conv3.jsonl")).unwrap();
    assert_eq!(content.lines().count(), 1);
}

/// Mock that requests one `code_search` call, then answers.
struct ToolCallingMock {
    step: std::sync::atomic::AtomicUsize,
}

impl ToolCallingMock {
    fn new() -> Self {
        Self {
            step: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provider for ToolCallingMock {
    fn name(&self) -> &str {
        "toolmock"
    }

    async fn call(
        &self,
        req: &ouro::runtime::LlmRequest,
        model: &str,
        _key: &ApiKey,
        _cancel: &CancellationToken,
    ) -> Result<ouro::runtime::LlmResponse, ouro::runtime::ProviderError> {
        let step = self.step.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if step == 0 {
            assert!(
                req.tools.iter().any(|t| t.name == "code_search"),
                "registry specs must be offered to the model"
            );
            Ok(ouro::runtime::LlmResponse {
                content: "let me search".into(),
                tool_calls: vec![ouro::pipeline::ToolCall::new(
                    "code_search",
                    json!({"query": "auth"}),
                )],
                finish_reason: ouro::runtime::FinishReason::ToolCalls,
                model: model.to_string(),
                ..Default::default()
            })
        } else {
            assert!(
                req.context.iter().any(|m| m.role == Role::Tool),
                "tool results must be in context on the next step"
            );
            Ok(ouro::runtime::LlmResponse {
                content: "found it".into(),
                ..Default::default()
            })
        }
    }

    async fn stream(
        &self,
        _req: &ouro::runtime::LlmRequest,
        _model: &str,
        _key: &ApiKey,
        _cancel: &CancellationToken,
    ) -> Result<ouro::runtime::DeltaStream, ouro::runtime::ProviderError> {
        Err(ouro::runtime::ProviderError::classified(
            "toolmock",
            "streaming not scripted",
        ))
    }
}
