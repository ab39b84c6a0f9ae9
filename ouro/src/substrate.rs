//! Process-wide wiring.
//!
//! One [`Substrate`] per process: a single memory engine, dispatcher, tool
//! pipeline, and evolution loop, constructed together from the typed config
//! document and torn down together. Dispatcher attempt metrics flow into the
//! memory engine's metric store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::ChatTurn;
use crate::evolution::{EvolutionError, EvolutionLoop};
use crate::memory::{LogWatcher, MemoryEngine, MemoryError, Metric};
use crate::pipeline::{
    BreakerSettings, CircuitBreaker, RateLimiter, SecurityPolicy, ToolPipeline, ToolRegistry,
};
use crate::runtime::{
    ApiKey, AttemptRecord, ChainEntry, Dispatcher, MetricsSink, Provider,
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Evolution(#[from] EvolutionError),
}

/// The assembled substrate. Construct once at startup, inside the runtime.
pub struct Substrate {
    pub memory: Arc<MemoryEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub pipeline: Arc<ToolPipeline>,
    pub evolution: EvolutionLoop,
    watcher: Option<LogWatcher>,
    cancel: CancellationToken,
}

impl Substrate {
    /// Wires every subsystem from the config document. Providers and the
    /// tool registry are supplied by the caller; tool implementations are
    /// outside the substrate's contract.
    pub fn initialize(
        cfg: &env_config::OuroConfig,
        providers: Vec<Arc<dyn Provider>>,
        registry: ToolRegistry,
    ) -> Result<Self, InitError> {
        let cancel = CancellationToken::new();

        let memory = Arc::new(MemoryEngine::open(&cfg.memory)?);
        let watcher = memory.spawn_watcher(
            Duration::from_millis(cfg.watcher.debounce_ms),
            cancel.child_token(),
        )?;

        let mut builder = Dispatcher::builder()
            .chain(
                cfg.failover_chain
                    .iter()
                    .map(|e| ChainEntry::new(&e.provider, &e.model))
                    .collect(),
            )
            .metrics(Arc::new(MemoryMetricsSink {
                memory: Arc::clone(&memory),
            }));
        for provider in providers {
            builder = builder.provider(provider);
        }
        for (name, pc) in &cfg.providers {
            let keys = pc
                .keys
                .iter()
                .enumerate()
                .map(|(i, secret)| ApiKey::new(format!("{name}-key-{i}"), secret))
                .collect();
            match pc.key_cooldown_ms {
                Some(ms) => {
                    builder = builder.keys_with_cooldown(name, keys, Duration::from_millis(ms))
                }
                None => builder = builder.keys(name, keys),
            }
        }
        let dispatcher = Arc::new(builder.build());

        let breaker = CircuitBreaker::new(
            breaker_settings(&cfg.circuit_breaker),
            cfg.circuit_breaker
                .overrides
                .iter()
                .map(|(tool, o)| (tool.clone(), breaker_override(&cfg.circuit_breaker, o)))
                .collect(),
        );
        let pipeline = Arc::new(ToolPipeline::new(
            Arc::new(registry),
            SecurityPolicy::new(
                cfg.security.base_directory.clone(),
                &cfg.security.allowed_endpoints,
            ),
            RateLimiter::new(cfg.rate_limit.clone().into_iter().collect::<HashMap<_, _>>()),
            breaker,
        ));

        let evolution = EvolutionLoop::from_config(&cfg.envs)?;

        info!("substrate initialized");
        Ok(Self {
            memory,
            dispatcher,
            pipeline,
            evolution,
            watcher: Some(watcher),
            cancel,
        })
    }

    /// Cancellation root; child tokens honor shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A chat turn wired to this substrate's components.
    pub fn chat_turn(&self) -> ChatTurn {
        ChatTurn::new(
            Arc::clone(&self.memory),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.pipeline),
        )
    }

    /// Drains in-flight work within the grace period, then aborts. The
    /// watcher finishes its in-flight reconcile before stopping.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            if tokio::time::timeout(grace, watcher.shutdown()).await.is_err() {
                warn!("watcher did not stop within the grace period");
            }
        }
        info!("substrate shut down");
    }
}

fn breaker_settings(cfg: &env_config::BreakerConfig) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: cfg.failure_threshold,
        cooldown: Duration::from_millis(cfg.cooldown_ms),
        success_threshold: cfg.success_threshold,
    }
}

fn breaker_override(
    base: &env_config::BreakerConfig,
    o: &env_config::BreakerOverride,
) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: o.failure_threshold.unwrap_or(base.failure_threshold),
        cooldown: Duration::from_millis(o.cooldown_ms.unwrap_or(base.cooldown_ms)),
        success_threshold: o.success_threshold.unwrap_or(base.success_threshold),
    }
}

/// Feeds dispatcher attempt records into the metric store, off the hot path.
struct MemoryMetricsSink {
    memory: Arc<MemoryEngine>,
}

impl MetricsSink for MemoryMetricsSink {
    fn record_attempt(&self, record: AttemptRecord) {
        let memory = Arc::clone(&self.memory);
        tokio::spawn(async move {
            let metric = Metric::now(
                "llm_attempt",
                format!("{}/{}", record.provider, record.model),
                record.latency_ms as f64,
            )
            .with_context(
                serde_json::json!({
                    "task_type": record.task_type,
                    "key_id": record.key_id,
                    "class": record.class.map(|c| c.as_str()),
                    "tokens": record.tokens,
                })
                .to_string(),
            );
            if let Err(e) = memory.record_metric(&metric).await {
                warn!("failed to record llm attempt metric: {e}");
            }
        });
    }
}
