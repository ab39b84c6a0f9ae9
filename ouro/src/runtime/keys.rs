//! Auth-key rotation.
//!
//! Each provider registers a set of API keys. Selection is round-robin over
//! keys not currently marked auth-failed; a failed key is skipped until its
//! cooldown elapses, then offered again, and its failure record is cleared on
//! the first subsequent success.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;

/// One credential: a stable id (for metrics and health reporting) and the
/// secret itself. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct ApiKey {
    pub id: String,
    pub secret: String,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey").field("id", &self.id).finish()
    }
}

/// Health snapshot for one `(provider, key)` pair.
#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub provider: String,
    pub key_id: String,
    pub consecutive_auth_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct KeyState {
    consecutive_auth_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl KeyState {
    fn available(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

struct ProviderKeys {
    keys: Vec<ApiKey>,
    states: Vec<KeyState>,
    cursor: usize,
    cooldown: Duration,
}

/// Round-robin key selection with auth-failure cooldowns, per provider.
///
/// Mutation happens under a per-provider mutex; [`KeyRing::health`] returns
/// snapshots.
pub struct KeyRing {
    providers: DashMap<String, Mutex<ProviderKeys>>,
    default_cooldown: Duration,
}

impl KeyRing {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            default_cooldown,
        }
    }

    /// Registers the rotation set for a provider, replacing any previous set.
    pub fn register(&self, provider: impl Into<String>, keys: Vec<ApiKey>) {
        self.register_with_cooldown(provider, keys, self.default_cooldown);
    }

    /// Registers a rotation set with a provider-specific cooldown.
    pub fn register_with_cooldown(
        &self,
        provider: impl Into<String>,
        keys: Vec<ApiKey>,
        cooldown: Duration,
    ) {
        let states = keys.iter().map(|_| KeyState::default()).collect();
        self.providers.insert(
            provider.into(),
            Mutex::new(ProviderKeys {
                keys,
                states,
                cursor: 0,
                cooldown,
            }),
        );
    }

    /// Next usable key for a provider: round-robin over keys whose cooldown
    /// (if any) has elapsed. Returns `None` when the provider has no keys or
    /// every key is cooling down.
    pub fn next_key(&self, provider: &str) -> Option<ApiKey> {
        let entry = self.providers.get(provider)?;
        let mut ring = entry.lock().unwrap_or_else(|e| e.into_inner());
        if ring.keys.is_empty() {
            return None;
        }
        let now = Utc::now();
        let n = ring.keys.len();
        for step in 0..n {
            let idx = (ring.cursor + step) % n;
            if ring.states[idx].available(now) {
                ring.cursor = (idx + 1) % n;
                return Some(ring.keys[idx].clone());
            }
        }
        None
    }

    /// Marks a key auth-failed: bumps its consecutive failure count and sets
    /// its cooldown. The key is skipped by [`KeyRing::next_key`] until the
    /// cooldown elapses.
    pub fn mark_auth_failure(&self, provider: &str, key_id: &str) {
        let Some(entry) = self.providers.get(provider) else {
            return;
        };
        let mut ring = entry.lock().unwrap_or_else(|e| e.into_inner());
        let cooldown = ring.cooldown;
        if let Some(idx) = ring.keys.iter().position(|k| k.id == key_id) {
            let now = Utc::now();
            let state = &mut ring.states[idx];
            state.consecutive_auth_failures += 1;
            state.last_failure_at = Some(now);
            state.cooldown_until = now.checked_add_signed(
                ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::zero()),
            );
        }
    }

    /// Clears the failure record for a key after a successful call.
    pub fn mark_success(&self, provider: &str, key_id: &str) {
        let Some(entry) = self.providers.get(provider) else {
            return;
        };
        let mut ring = entry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = ring.keys.iter().position(|k| k.id == key_id) {
            ring.states[idx] = KeyState::default();
        }
    }

    /// Snapshot of every registered `(provider, key)` pair.
    pub fn health(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::new();
        for entry in self.providers.iter() {
            let ring = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            for (key, state) in ring.keys.iter().zip(ring.states.iter()) {
                out.push(ProviderHealth {
                    provider: entry.key().clone(),
                    key_id: key.id.clone(),
                    consecutive_auth_failures: state.consecutive_auth_failures,
                    last_failure_at: state.last_failure_at,
                    cooldown_until: state.cooldown_until,
                });
            }
        }
        out
    }
}
