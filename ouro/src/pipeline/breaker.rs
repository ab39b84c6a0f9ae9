//! Per-tool circuit breaker.
//!
//! State machine per tool: `closed` counts consecutive failures and opens at
//! the threshold; `open` rejects calls until the cooldown elapses, then
//! admits one in `half-open`; `half-open` closes after enough successes and
//! reopens on any failure. Mutation happens under a per-tool mutex; getters
//! return snapshots.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Circuit health of one tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Breaker tuning for one tool.
#[derive(Clone, Copy, Debug)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Snapshot of one tool's circuit.
#[derive(Clone, Debug)]
pub struct CircuitSnapshot {
    pub tool_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
}

struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_retry_at: None,
            half_open_successes: 0,
        }
    }

    fn open(&mut self, cooldown: Duration, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_retry_at = now
            .checked_add_signed(ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::zero()));
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        *self = Circuit::new();
    }
}

/// Admission decision for a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Circuit is open and the cooldown has not elapsed.
    Rejected { retry_at: Option<DateTime<Utc>> },
}

/// Per-tool circuit breakers with global defaults and per-tool overrides.
pub struct CircuitBreaker {
    default: BreakerSettings,
    overrides: HashMap<String, BreakerSettings>,
    circuits: DashMap<String, Mutex<Circuit>>,
}

impl CircuitBreaker {
    pub fn new(default: BreakerSettings, overrides: HashMap<String, BreakerSettings>) -> Self {
        Self {
            default,
            overrides,
            circuits: DashMap::new(),
        }
    }

    fn settings_for(&self, tool: &str) -> BreakerSettings {
        self.overrides.get(tool).copied().unwrap_or(self.default)
    }

    fn with_circuit<T>(&self, tool: &str, f: impl FnOnce(&mut Circuit) -> T) -> T {
        let entry = self
            .circuits
            .entry(tool.to_string())
            .or_insert_with(|| Mutex::new(Circuit::new()));
        let mut circuit = entry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut circuit)
    }

    /// Gate before execution. An open circuit whose cooldown has elapsed
    /// transitions to half-open and admits the call.
    pub fn admit(&self, tool: &str) -> Admission {
        let now = Utc::now();
        self.with_circuit(tool, |c| match c.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed,
            CircuitState::Open => match c.next_retry_at {
                Some(at) if now < at => Admission::Rejected { retry_at: Some(at) },
                _ => {
                    c.state = CircuitState::HalfOpen;
                    c.half_open_successes = 0;
                    Admission::Allowed
                }
            },
        })
    }

    /// Executor success: resets a closed circuit's failure count; counts
    /// toward closing a half-open circuit.
    pub fn on_success(&self, tool: &str) {
        let success_threshold = self.settings_for(tool).success_threshold;
        self.with_circuit(tool, |c| match c.state {
            CircuitState::Closed => c.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                c.half_open_successes += 1;
                if c.half_open_successes >= success_threshold {
                    c.close();
                }
            }
            CircuitState::Open => {}
        });
    }

    /// Executor failure: counts toward opening a closed circuit; reopens a
    /// half-open circuit immediately.
    pub fn on_failure(&self, tool: &str) {
        let settings = self.settings_for(tool);
        let now = Utc::now();
        self.with_circuit(tool, |c| match c.state {
            CircuitState::Closed => {
                c.consecutive_failures += 1;
                if c.consecutive_failures >= settings.failure_threshold {
                    tracing::warn!(tool, "circuit opened");
                    c.open(settings.cooldown, now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(tool, "circuit reopened from half-open");
                c.open(settings.cooldown, now);
            }
            CircuitState::Open => {}
        });
    }

    pub fn snapshot(&self, tool: &str) -> CircuitSnapshot {
        self.with_circuit(tool, |c| CircuitSnapshot {
            tool_name: tool.to_string(),
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            opened_at: c.opened_at,
            next_retry_at: c.next_retry_at,
            half_open_successes: c.half_open_successes,
        })
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits
            .iter()
            .map(|entry| {
                let c = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                CircuitSnapshot {
                    tool_name: entry.key().clone(),
                    state: c.state,
                    consecutive_failures: c.consecutive_failures,
                    opened_at: c.opened_at,
                    next_retry_at: c.next_retry_at,
                    half_open_successes: c.half_open_successes,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerSettings {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
                success_threshold: successes,
            },
            HashMap::new(),
        )
    }

    #[test]
    fn opens_at_failure_threshold() {
        let b = breaker(3, 60_000, 2);
        b.on_failure("t");
        b.on_failure("t");
        assert_eq!(b.snapshot("t").state, CircuitState::Closed);
        b.on_failure("t");
        assert_eq!(b.snapshot("t").state, CircuitState::Open);
        assert!(matches!(b.admit("t"), Admission::Rejected { .. }));
    }

    #[test]
    fn success_resets_closed_count() {
        let b = breaker(3, 60_000, 2);
        b.on_failure("t");
        b.on_failure("t");
        b.on_success("t");
        b.on_failure("t");
        b.on_failure("t");
        assert_eq!(b.snapshot("t").state, CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_successes() {
        let b = breaker(1, 20, 2);
        b.on_failure("t");
        assert!(matches!(b.admit("t"), Admission::Rejected { .. }));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(b.admit("t"), Admission::Allowed);
        assert_eq!(b.snapshot("t").state, CircuitState::HalfOpen);

        b.on_success("t");
        assert_eq!(b.snapshot("t").state, CircuitState::HalfOpen);
        b.on_success("t");
        assert_eq!(b.snapshot("t").state, CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(1, 20, 2);
        b.on_failure("t");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(b.admit("t"), Admission::Allowed);
        b.on_failure("t");
        assert_eq!(b.snapshot("t").state, CircuitState::Open);
        assert!(matches!(b.admit("t"), Admission::Rejected { .. }));
    }

    #[test]
    fn per_tool_override_applies() {
        let b = CircuitBreaker::new(
            BreakerSettings::default(),
            HashMap::from([(
                "fragile".to_string(),
                BreakerSettings {
                    failure_threshold: 1,
                    cooldown: Duration::from_secs(60),
                    success_threshold: 2,
                },
            )]),
        );
        b.on_failure("fragile");
        assert_eq!(b.snapshot("fragile").state, CircuitState::Open);
        // Default tools still need three failures.
        b.on_failure("sturdy");
        assert_eq!(b.snapshot("sturdy").state, CircuitState::Closed);
    }
}
