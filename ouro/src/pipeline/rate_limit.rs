//! Per-tool token-bucket rate limiting.
//!
//! Each configured tool gets a bucket sized `tokens_per_minute` with
//! continuous refill; one call costs one token. Tools without a configured
//! limit are unlimited.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(tokens_per_minute: u32) -> Self {
        let capacity = f64::from(tokens_per_minute).max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets keyed by tool name.
pub struct RateLimiter {
    limits: HashMap<String, u32>,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimiter {
    /// `limits` maps tool name to tokens per minute.
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for the tool. `true` when the call is admitted.
    /// Unconfigured tools are always admitted.
    pub fn try_acquire(&self, tool: &str) -> bool {
        let Some(&tpm) = self.limits.get(tool) else {
            return true;
        };
        let bucket = self
            .buckets
            .entry(tool.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(tpm)));
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.try_take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(tool: &str, tpm: u32) -> RateLimiter {
        RateLimiter::new(HashMap::from([(tool.to_string(), tpm)]))
    }

    #[test]
    fn bucket_exhausts_after_capacity_calls() {
        let l = limiter("t", 3);
        assert!(l.try_acquire("t"));
        assert!(l.try_acquire("t"));
        assert!(l.try_acquire("t"));
        assert!(!l.try_acquire("t"));
    }

    #[test]
    fn unconfigured_tool_is_unlimited() {
        let l = limiter("t", 1);
        for _ in 0..50 {
            assert!(l.try_acquire("other"));
        }
    }

    #[test]
    fn bucket_refills_over_time() {
        // 600 tokens/min = 10/sec, so a short sleep restores a token.
        let l = limiter("t", 600);
        for _ in 0..600 {
            l.try_acquire("t");
        }
        assert!(!l.try_acquire("t"));
        std::thread::sleep(std::time::Duration::from_millis(150));
        assert!(l.try_acquire("t"));
    }
}
