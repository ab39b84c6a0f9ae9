//! Failover dispatcher.
//!
//! Walks an ordered chain of `(provider, model)` pairs, classifying every
//! failure and advancing until a pair answers or the chain is exhausted. Keys
//! are reused while the provider stays the same and rotated when it changes.
//! Streaming requests fail over only until the first delta is observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{DispatchError, ErrorClass, ProviderError};
use super::keys::{ApiKey, KeyRing, ProviderHealth};
use super::{DeltaStream, LlmRequest, LlmResponse, Provider};

/// One entry in the failover chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEntry {
    pub provider: String,
    pub model: String,
}

impl ChainEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Metric emitted for every attempt, success or failure.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub task_type: String,
    pub provider: String,
    pub model: String,
    pub key_id: String,
    /// `None` on success.
    pub class: Option<ErrorClass>,
    pub latency_ms: u64,
    pub tokens: Option<u32>,
}

/// Receives one record per dispatcher attempt.
///
/// The process wires this to the memory engine's metric store; tests install
/// an in-memory collector. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record_attempt(&self, record: AttemptRecord);
}

/// Builds a [`Dispatcher`]; providers and chain are fixed after construction.
#[derive(Default)]
pub struct DispatcherBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
    chain: Vec<ChainEntry>,
    key_cooldown: Option<Duration>,
    keys: Vec<(String, Vec<ApiKey>, Option<Duration>)>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn chain(mut self, chain: Vec<ChainEntry>) -> Self {
        self.chain = chain;
        self
    }

    /// Default cooldown for auth-failed keys (60 s when unset).
    pub fn key_cooldown(mut self, cooldown: Duration) -> Self {
        self.key_cooldown = Some(cooldown);
        self
    }

    pub fn keys(mut self, provider: impl Into<String>, keys: Vec<ApiKey>) -> Self {
        self.keys.push((provider.into(), keys, None));
        self
    }

    pub fn keys_with_cooldown(
        mut self,
        provider: impl Into<String>,
        keys: Vec<ApiKey>,
        cooldown: Duration,
    ) -> Self {
        self.keys.push((provider.into(), keys, Some(cooldown)));
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn build(self) -> Dispatcher {
        let ring = KeyRing::new(self.key_cooldown.unwrap_or(Duration::from_secs(60)));
        for (provider, keys, cooldown) in self.keys {
            match cooldown {
                Some(c) => ring.register_with_cooldown(provider, keys, c),
                None => ring.register(provider, keys),
            }
        }
        Dispatcher {
            providers: self.providers,
            chain: self.chain,
            keys: ring,
            metrics: self.metrics,
        }
    }
}

/// The runtime dispatcher. One per process.
pub struct Dispatcher {
    providers: HashMap<String, Arc<dyn Provider>>,
    chain: Vec<ChainEntry>,
    keys: KeyRing,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Key ring health snapshots, for the monitoring surface.
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.keys.health()
    }

    /// Effective chain for a request: the preferred model (when it names a
    /// configured pair) moved to the front, then the configured fallbacks.
    fn effective_chain(&self, req: &LlmRequest) -> Vec<ChainEntry> {
        let mut chain = self.chain.clone();
        if let Some(pref) = &req.preferred_model {
            let preferred = match pref.split_once(':') {
                Some((provider, model)) => ChainEntry::new(provider, model),
                None => match chain.iter().find(|e| e.model == *pref) {
                    Some(e) => e.clone(),
                    // Bare model not in the chain: try it on the first
                    // configured provider before the fallbacks.
                    None => match chain.first() {
                        Some(first) => ChainEntry::new(first.provider.clone(), pref.clone()),
                        None => return chain,
                    },
                },
            };
            chain.retain(|e| *e != preferred);
            chain.insert(0, preferred);
        }
        chain
    }

    fn record(&self, record: AttemptRecord) {
        if let Some(sink) = &self.metrics {
            sink.record_attempt(record);
        }
    }

    /// Picks a key for `provider`, reusing the one already chosen for it
    /// during this dispatch. A provider with no usable key yields an
    /// auth-class error so the chain advances.
    fn key_for(
        &self,
        held: &mut HashMap<String, ApiKey>,
        provider: &str,
    ) -> Result<ApiKey, ProviderError> {
        if let Some(key) = held.get(provider) {
            return Ok(key.clone());
        }
        let key = self.keys.next_key(provider).ok_or_else(|| {
            ProviderError::with_class(provider, ErrorClass::Auth, "no usable api keys")
        })?;
        held.insert(provider.to_string(), key.clone());
        Ok(key)
    }

    fn after_failure(
        &self,
        req: &LlmRequest,
        entry: &ChainEntry,
        key_id: &str,
        err: &ProviderError,
        latency: Duration,
        held: &mut HashMap<String, ApiKey>,
    ) {
        warn!(
            provider = entry.provider.as_str(),
            model = entry.model.as_str(),
            class = err.class.as_str(),
            "llm attempt failed"
        );
        self.record(AttemptRecord {
            task_type: req.task_type.clone(),
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            key_id: key_id.to_string(),
            class: Some(err.class),
            latency_ms: latency.as_millis() as u64,
            tokens: None,
        });
        if err.class.marks_key_failed() {
            self.keys.mark_auth_failure(&entry.provider, key_id);
            // Force a fresh rotation pick if the chain revisits this provider.
            held.remove(&entry.provider);
        }
    }

    fn after_success(
        &self,
        req: &LlmRequest,
        entry: &ChainEntry,
        key_id: &str,
        latency: Duration,
        tokens: Option<u32>,
    ) {
        self.keys.mark_success(&entry.provider, key_id);
        self.record(AttemptRecord {
            task_type: req.task_type.clone(),
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            key_id: key_id.to_string(),
            class: None,
            latency_ms: latency.as_millis() as u64,
            tokens,
        });
    }

    /// Non-streaming dispatch: tries each chain pair once, in order.
    ///
    /// The surfaced error after exhaustion is the last provider's, annotated
    /// with the full chain attempted.
    pub async fn dispatch(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, DispatchError> {
        let chain = self.effective_chain(req);
        if chain.is_empty() {
            return Err(DispatchError::EmptyChain);
        }

        let mut held_keys: HashMap<String, ApiKey> = HashMap::new();
        let mut attempted: Vec<(String, String)> = Vec::new();
        let mut last_err: Option<ProviderError> = None;

        for entry in &chain {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            attempted.push((entry.provider.clone(), entry.model.clone()));

            let outcome = self.attempt_call(req, entry, &mut held_keys, cancel).await;
            match outcome {
                AttemptOutcome::Response(resp) => return Ok(resp),
                AttemptOutcome::Cancelled => return Err(DispatchError::Cancelled),
                AttemptOutcome::Failed(err) => last_err = Some(err),
            }
        }

        Err(DispatchError::ChainExhausted {
            // attempted is non-empty here, so at least one error was recorded
            last: last_err.unwrap_or_else(|| {
                ProviderError::with_class("", ErrorClass::Unknown, "no attempts made")
            }),
            attempted,
        })
    }

    async fn attempt_call(
        &self,
        req: &LlmRequest,
        entry: &ChainEntry,
        held_keys: &mut HashMap<String, ApiKey>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let Some(provider) = self.providers.get(&entry.provider) else {
            let err = ProviderError::with_class(
                &entry.provider,
                ErrorClass::Unknown,
                "provider not configured",
            );
            self.after_failure(req, entry, "-", &err, Duration::ZERO, held_keys);
            return AttemptOutcome::Failed(err);
        };
        let key = match self.key_for(held_keys, &entry.provider) {
            Ok(k) => k,
            Err(err) => {
                self.after_failure(req, entry, "-", &err, Duration::ZERO, held_keys);
                return AttemptOutcome::Failed(err);
            }
        };

        debug!(
            provider = entry.provider.as_str(),
            model = entry.model.as_str(),
            key_id = key.id.as_str(),
            "llm attempt"
        );
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            r = provider.call(req, &entry.model, &key, cancel) => r,
        };
        let latency = started.elapsed();

        match result {
            Ok(mut resp) => {
                resp.provider = entry.provider.clone();
                resp.model = entry.model.clone();
                let tokens = resp.usage.map(|u| u.total_tokens);
                self.after_success(req, entry, &key.id, latency, tokens);
                AttemptOutcome::Response(resp)
            }
            Err(err) => {
                self.after_failure(req, entry, &key.id, &err, latency, held_keys);
                AttemptOutcome::Failed(err)
            }
        }
    }

    /// Streaming dispatch. Failover applies until the first delta has been
    /// observed; after that the stream is committed and runs until the
    /// provider ends it (an error mid-stream terminates the stream, it does
    /// not restart elsewhere).
    pub async fn dispatch_stream(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, DispatchError> {
        let chain = self.effective_chain(req);
        if chain.is_empty() {
            return Err(DispatchError::EmptyChain);
        }

        let mut held_keys: HashMap<String, ApiKey> = HashMap::new();
        let mut attempted: Vec<(String, String)> = Vec::new();
        let mut last_err: Option<ProviderError> = None;

        for entry in &chain {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            attempted.push((entry.provider.clone(), entry.model.clone()));

            let Some(provider) = self.providers.get(&entry.provider) else {
                let err = ProviderError::with_class(
                    &entry.provider,
                    ErrorClass::Unknown,
                    "provider not configured",
                );
                self.after_failure(req, entry, "-", &err, Duration::ZERO, &mut held_keys);
                last_err = Some(err);
                continue;
            };
            let key = match self.key_for(&mut held_keys, &entry.provider) {
                Ok(k) => k,
                Err(err) => {
                    self.after_failure(req, entry, "-", &err, Duration::ZERO, &mut held_keys);
                    last_err = Some(err);
                    continue;
                }
            };

            let started = Instant::now();
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                r = provider.stream(req, &entry.model, &key, cancel) => r,
            };
            let mut stream = match stream {
                Ok(s) => s,
                Err(err) => {
                    self.after_failure(req, entry, &key.id, &err, started.elapsed(), &mut held_keys);
                    last_err = Some(err);
                    continue;
                }
            };

            // Peek the first item: an error before any delta is still
            // failover-eligible; a delta commits this provider.
            let first = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                item = stream.next() => item,
            };
            match first {
                Some(Ok(delta)) => {
                    self.after_success(req, entry, &key.id, started.elapsed(), None);
                    stream.push_front(delta);
                    return Ok(stream);
                }
                None => {
                    // Empty stream: the provider answered with no content.
                    self.after_success(req, entry, &key.id, started.elapsed(), None);
                    return Ok(stream);
                }
                Some(Err(err)) => {
                    self.after_failure(req, entry, &key.id, &err, started.elapsed(), &mut held_keys);
                    last_err = Some(err);
                }
            }
        }

        Err(DispatchError::ChainExhausted {
            last: last_err.unwrap_or_else(|| {
                ProviderError::with_class("", ErrorClass::Unknown, "no attempts made")
            }),
            attempted,
        })
    }
}

enum AttemptOutcome {
    Response(LlmResponse),
    Failed(ProviderError),
    Cancelled,
}
