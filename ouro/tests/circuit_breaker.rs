//! Circuit breaker behavior through the full pipeline.

mod init_logging;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ouro::pipeline::{
    BreakerSettings, CircuitBreaker, CircuitState, Executor, ExecutorFailure, ParamSchema,
    RateLimiter, SecurityPolicy, ToolCall, ToolErrorCode, ToolOutcome, ToolPipeline,
    ToolRegistry, ToolSpec,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Counts invocations; fails while `failures_left` is positive.
struct FlakyExecutor {
    invocations: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FlakyExecutor {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn run(
        &self,
        _args: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExecutorFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err(ExecutorFailure::new("backend unavailable"))
        } else {
            Ok(json!("recovered"))
        }
    }
}

fn pipeline_with(
    executor: Arc<FlakyExecutor>,
    threshold: u32,
    cooldown: Duration,
    success_threshold: u32,
) -> ToolPipeline {
    let registry = ToolRegistry::builder()
        .register(
            ToolSpec::new("flaky", "sometimes works", "test", ParamSchema::new()),
            executor,
        )
        .build();
    ToolPipeline::new(
        Arc::new(registry),
        SecurityPolicy::new("/tmp/ouro-breaker-test", &[]),
        RateLimiter::new(HashMap::new()),
        CircuitBreaker::new(
            BreakerSettings {
                failure_threshold: threshold,
                cooldown,
                success_threshold,
            },
            HashMap::new(),
        ),
    )
}

async fn call(p: &ToolPipeline) -> ToolOutcome {
    p.execute(&ToolCall::new("flaky", json!({})), &CancellationToken::new())
        .await
}

/// **Scenario**: threshold 3, cooldown 100 ms. Calls 1-3 reach the
/// executor and fail; calls 4-7 during cooldown are rejected without
/// invoking it; after the cooldown one call reaches the executor
/// (half-open) and, with a second success, the circuit closes.
#[tokio::test]
async fn open_cooldown_half_open_close_cycle() {
    init_logging::init();
    let executor = FlakyExecutor::new(3);
    let p = pipeline_with(Arc::clone(&executor), 3, Duration::from_millis(100), 2);

    for i in 0..3 {
        let outcome = call(&p).await;
        assert_eq!(
            outcome.error_code(),
            Some(ToolErrorCode::ExecutorError),
            "call {i} should reach the executor and fail"
        );
    }
    assert_eq!(executor.invocations.load(Ordering::SeqCst), 3);
    assert_eq!(p.circuit_snapshot("flaky").state, CircuitState::Open);

    for i in 3..7 {
        let outcome = call(&p).await;
        assert_eq!(
            outcome.error_code(),
            Some(ToolErrorCode::CircuitOpen),
            "call {i} should be rejected while cooling down"
        );
    }
    assert_eq!(
        executor.invocations.load(Ordering::SeqCst),
        3,
        "rejected calls must not reach the executor"
    );

    tokio::time::sleep(Duration::from_millis(120)).await;

    let outcome = call(&p).await;
    assert!(outcome.ok, "first call after cooldown reaches the executor");
    assert_eq!(executor.invocations.load(Ordering::SeqCst), 4);
    assert_eq!(p.circuit_snapshot("flaky").state, CircuitState::HalfOpen);

    let outcome = call(&p).await;
    assert!(outcome.ok);
    assert_eq!(p.circuit_snapshot("flaky").state, CircuitState::Closed);
}

/// **Scenario**: a failure in half-open reopens immediately and restarts the
/// cooldown.
#[tokio::test]
async fn half_open_failure_reopens() {
    init_logging::init();
    // 4 failures: 3 to open, 1 more for the half-open probe.
    let executor = FlakyExecutor::new(4);
    let p = pipeline_with(Arc::clone(&executor), 3, Duration::from_millis(80), 2);

    for _ in 0..3 {
        call(&p).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = call(&p).await;
    assert_eq!(outcome.error_code(), Some(ToolErrorCode::ExecutorError));
    assert_eq!(p.circuit_snapshot("flaky").state, CircuitState::Open);

    let outcome = call(&p).await;
    assert_eq!(outcome.error_code(), Some(ToolErrorCode::CircuitOpen));
}

/// **Scenario**: successes under the threshold keep resetting the failure
/// count; the circuit never opens.
#[tokio::test]
async fn interleaved_successes_keep_circuit_closed() {
    init_logging::init();
    let executor = FlakyExecutor::new(2);
    let p = pipeline_with(Arc::clone(&executor), 3, Duration::from_secs(60), 2);

    call(&p).await; // fail 1
    call(&p).await; // fail 2
    let outcome = call(&p).await; // success resets the count
    assert!(outcome.ok);
    assert_eq!(p.circuit_snapshot("flaky").state, CircuitState::Closed);
    assert_eq!(p.circuit_snapshot("flaky").consecutive_failures, 0);
}

/// **Scenario**: circuit rejections are visible in metrics with their own
/// error code, and executed failures count separately.
#[tokio::test]
async fn metrics_count_rejections_and_failures_separately() {
    init_logging::init();
    let executor = FlakyExecutor::new(3);
    let p = pipeline_with(Arc::clone(&executor), 3, Duration::from_secs(60), 2);

    for _ in 0..3 {
        call(&p).await;
    }
    call(&p).await; // rejected: circuit open

    let snap = p.metrics().snapshot("flaky").unwrap();
    assert_eq!(snap.total, 4);
    assert_eq!(snap.failures, 4);
    assert_eq!(snap.errors_by_code[&ToolErrorCode::ExecutorError], 3);
    assert_eq!(snap.errors_by_code[&ToolErrorCode::CircuitOpen], 1);
}
