//! Tool invocation pipeline: registry, validation, admission control, and
//! metered execution.
//!
//! The dispatcher hands a named [`ToolCall`] to [`ToolPipeline::execute`],
//! which runs the stages in order (lookup, schema validation, security
//! validation, rate limit, circuit breaker, execution with timeout) and
//! always returns a uniform [`ToolOutcome`]. Nothing is thrown at the caller;
//! the outcome's JSON form is what the LLM sees as the tool result.

mod breaker;
mod error;
mod metrics;
mod rate_limit;
mod schema;
mod security;

pub use breaker::{
    Admission, BreakerSettings, CircuitBreaker, CircuitSnapshot, CircuitState,
};
pub use error::{ToolError, ToolErrorCode, ToolOutcome};
pub use metrics::{GlobalStatsSnapshot, ToolMetrics, ToolStatsSnapshot};
pub use rate_limit::RateLimiter;
pub use schema::{ParamFormat, ParamKind, ParamSchema, ParamSpec};
pub use security::SecurityPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runtime::ToolDef;

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One named tool call, as produced by the LLM.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub args: serde_json::Value,
    /// Correlates the call with its result across the turn.
    pub trace_id: String,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Declared identity of a tool: name, description, category, parameters.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    pub params: ParamSchema,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        params: ParamSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            params,
        }
    }

    /// The tool-definition shape offered to the LLM.
    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.params.to_json_schema(),
        }
    }
}

/// Opaque executor failure; the pipeline wraps it as `executor_error`.
#[derive(Clone, Debug)]
pub struct ExecutorFailure {
    pub message: String,
}

impl ExecutorFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The work half of a tool. Validation has already happened when `run` is
/// invoked; implementations must honor `cancel` at their suspension points.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        args: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ExecutorFailure>;
}

struct RegisteredTool {
    spec: ToolSpec,
    executor: Arc<dyn Executor>,
    timeout: Duration,
}

/// Builds the registry at process startup. Once built, the registry is
/// read-only for the life of the process.
#[derive(Default)]
pub struct RegistryBuilder {
    tools: HashMap<String, RegisteredTool>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, spec: ToolSpec, executor: Arc<dyn Executor>) -> Self {
        self.register_with_timeout(spec, executor, DEFAULT_TOOL_TIMEOUT)
    }

    pub fn register_with_timeout(
        mut self,
        spec: ToolSpec,
        executor: Arc<dyn Executor>,
        timeout: Duration,
    ) -> Self {
        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec,
                executor,
                timeout,
            },
        );
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Read-only tool registry.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get_spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    /// Every registered spec, for offering tools to the LLM.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|t| &t.spec).collect()
    }

    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.spec.to_tool_def()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The staged tool pipeline. One per process.
pub struct ToolPipeline {
    registry: Arc<ToolRegistry>,
    security: SecurityPolicy,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    metrics: ToolMetrics,
}

impl ToolPipeline {
    pub fn new(
        registry: Arc<ToolRegistry>,
        security: SecurityPolicy,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            registry,
            security,
            limiter,
            breaker,
            metrics: ToolMetrics::new(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &ToolMetrics {
        &self.metrics
    }

    pub fn circuit_snapshot(&self, tool: &str) -> CircuitSnapshot {
        self.breaker.snapshot(tool)
    }

    /// Runs one tool call through every stage. Always returns an outcome;
    /// stage rejections and executor failures alike are structured errors.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutcome {
        let started = Instant::now();
        let outcome = self.execute_inner(call, cancel, started).await;
        // Record: metrics always; breaker only for outcomes the executor
        // produced (stage rejections and cancellations must not move the
        // circuit).
        self.metrics.record(&call.tool_name, &outcome);
        outcome
    }

    async fn execute_inner(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ToolOutcome {
        let elapsed = |s: Instant| s.elapsed().as_millis() as u64;
        let name = call.tool_name.as_str();

        // 1. Lookup
        let Some(tool) = self.registry.tools.get(name) else {
            return ToolOutcome::failure(
                ToolErrorCode::ToolNotFound,
                format!("unknown tool: {name}"),
                elapsed(started),
            );
        };

        // 2. Schema validation
        if let Err(msg) = tool.spec.params.validate(&call.args) {
            return ToolOutcome::failure(ToolErrorCode::InvalidArgs, msg, elapsed(started));
        }

        // 3. Security validation
        if let Err(msg) = self.security.validate_args(&tool.spec.params, &call.args) {
            return ToolOutcome::failure(ToolErrorCode::SecurityViolation, msg, elapsed(started));
        }

        // 4. Rate limiter
        if !self.limiter.try_acquire(name) {
            return ToolOutcome::failure(
                ToolErrorCode::RateLimited,
                format!("rate limit exceeded for {name}"),
                elapsed(started),
            );
        }

        // 5. Circuit breaker
        if let Admission::Rejected { retry_at } = self.breaker.admit(name) {
            let msg = match retry_at {
                Some(at) => format!("circuit open for {name}; retry after {at}"),
                None => format!("circuit open for {name}"),
            };
            return ToolOutcome::failure(ToolErrorCode::CircuitOpen, msg, elapsed(started));
        }

        // 6. Execute with timeout and cancellation
        debug!(tool = name, trace_id = call.trace_id.as_str(), "executing tool");
        let run = tool.executor.run(&call.args, cancel);
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return ToolOutcome::failure(
                    ToolErrorCode::ExecutorError,
                    "call cancelled",
                    elapsed(started),
                )
                .with_metadata(serde_json::json!({"cancelled": true}));
            }
            r = tokio::time::timeout(tool.timeout, run) => r,
        };

        // 7. Breaker notification for executed calls
        match result {
            Err(_) => {
                self.breaker.on_failure(name);
                ToolOutcome::failure(
                    ToolErrorCode::Timeout,
                    format!("tool {name} exceeded {}ms", tool.timeout.as_millis()),
                    elapsed(started),
                )
            }
            Ok(Err(failure)) => {
                self.breaker.on_failure(name);
                ToolOutcome::failure(ToolErrorCode::ExecutorError, failure.message, elapsed(started))
            }
            Ok(Ok(value)) => {
                self.breaker.on_success(name);
                ToolOutcome::success(value, elapsed(started))
            }
        }
    }
}
