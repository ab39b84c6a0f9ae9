//! Provider error classification.
//!
//! Every provider failure is mapped by substring inspection of its message
//! into exactly one [`ErrorClass`]. The class determines dispatcher policy:
//! every class is failover-eligible; `Auth` and `Billing` additionally mark
//! the `(provider, key)` pair as auth-failed so rotation skips it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified provider failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    Billing,
    Context,
    Timeout,
    RateLimit,
    Unavailable,
    Unknown,
}

impl ErrorClass {
    /// Maps an error message to a class by lower-cased substring inspection.
    /// Classes are checked in a fixed order; the first match wins.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();

        const AUTH: &[&str] = &[
            "unauthorized",
            "invalid api key",
            "invalid_api_key",
            "authentication",
            "forbidden",
            "401",
            "403",
        ];
        const BILLING: &[&str] = &[
            "billing",
            "quota",
            "payment required",
            "insufficient credit",
            "402",
        ];
        const CONTEXT: &[&str] = &[
            "context length",
            "context_length",
            "maximum context",
            "too many tokens",
            "prompt is too long",
        ];
        const TIMEOUT: &[&str] = &["timed out", "timeout", "deadline exceeded"];
        const RATE_LIMIT: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
        const UNAVAILABLE: &[&str] = &[
            "unavailable",
            "overloaded",
            "bad gateway",
            "500",
            "502",
            "503",
            "529",
        ];

        let hit = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

        if hit(AUTH) {
            ErrorClass::Auth
        } else if hit(BILLING) {
            ErrorClass::Billing
        } else if hit(CONTEXT) {
            ErrorClass::Context
        } else if hit(TIMEOUT) {
            ErrorClass::Timeout
        } else if hit(RATE_LIMIT) {
            ErrorClass::RateLimit
        } else if hit(UNAVAILABLE) {
            ErrorClass::Unavailable
        } else {
            ErrorClass::Unknown
        }
    }

    /// Whether this class marks the `(provider, key)` pair as auth-failed.
    /// Failover itself is class-independent: every class advances the chain.
    pub fn marks_key_failed(&self) -> bool {
        matches!(self, ErrorClass::Auth | ErrorClass::Billing)
    }

    /// Wire name (snake_case), used in metrics and tool-result surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::Billing => "billing",
            ErrorClass::Context => "context",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from one provider call.
#[derive(Clone, Debug, Error)]
#[error("provider {provider} ({class}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    /// Builds an error, classifying the message.
    pub fn classified(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            provider: provider.into(),
            class: ErrorClass::classify(&message),
            message,
        }
    }

    /// Builds an error with a known class, bypassing substring inspection.
    pub fn with_class(
        provider: impl Into<String>,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            class,
            message: message.into(),
        }
    }
}

/// Terminal dispatcher failure, after the chain is exhausted (or empty).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every `(provider, model)` pair failed; carries the last provider error
    /// and the full chain attempted, in order.
    #[error("failover chain exhausted after {} attempts; last: {last}", attempted.len())]
    ChainExhausted {
        last: ProviderError,
        /// `(provider, model)` pairs, in attempt order.
        attempted: Vec<(String, String)>,
    },
    #[error("no failover chain configured")]
    EmptyChain,
    /// Not a failure: the caller's cancellation handle fired.
    #[error("dispatch cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_table() {
        let cases = [
            ("Unauthorized", ErrorClass::Auth),
            ("HTTP 401: invalid api key", ErrorClass::Auth),
            ("You exceeded your current quota, check billing", ErrorClass::Billing),
            ("This model's maximum context length is 8192", ErrorClass::Context),
            ("request timed out after 30s", ErrorClass::Timeout),
            ("HTTP 429: Too Many Requests", ErrorClass::RateLimit),
            ("HTTP 503: service unavailable", ErrorClass::Unavailable),
            ("the model is overloaded", ErrorClass::Unavailable),
            ("something inscrutable happened", ErrorClass::Unknown),
        ];
        for (msg, want) in cases {
            assert_eq!(ErrorClass::classify(msg), want, "message: {msg}");
        }
    }

    #[test]
    fn only_auth_and_billing_mark_keys() {
        assert!(ErrorClass::Auth.marks_key_failed());
        assert!(ErrorClass::Billing.marks_key_failed());
        for class in [
            ErrorClass::Context,
            ErrorClass::Timeout,
            ErrorClass::RateLimit,
            ErrorClass::Unavailable,
            ErrorClass::Unknown,
        ] {
            assert!(!class.marks_key_failed(), "{class} must not mark keys");
        }
    }
}
