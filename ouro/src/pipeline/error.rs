//! Structured tool failure codes and the uniform outcome shape.
//!
//! The pipeline never throws at its caller: every path produces a
//! [`ToolOutcome`] whose JSON form is the wire contract toward the LLM:
//! `{ok, result?, error?{code, message}, execution_ms, metadata?}`.

use serde::{Deserialize, Serialize};

/// Why a tool call failed. Wire names are snake_case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    ToolNotFound,
    InvalidArgs,
    SecurityViolation,
    RateLimited,
    CircuitOpen,
    Timeout,
    ExecutorError,
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorCode::ToolNotFound => "tool_not_found",
            ToolErrorCode::InvalidArgs => "invalid_args",
            ToolErrorCode::SecurityViolation => "security_violation",
            ToolErrorCode::RateLimited => "rate_limited",
            ToolErrorCode::CircuitOpen => "circuit_open",
            ToolErrorCode::Timeout => "timeout",
            ToolErrorCode::ExecutorError => "executor_error",
        }
    }
}

impl std::fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error half of a failed outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
}

/// Result of one tool invocation, success or failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub execution_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutcome {
    pub fn success(result: serde_json::Value, execution_ms: u64) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            execution_ms,
            metadata: None,
        }
    }

    pub fn failure(code: ToolErrorCode, message: impl Into<String>, execution_ms: u64) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ToolError {
                code,
                message: message.into(),
            }),
            execution_ms,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Error code, when this outcome is a failure.
    pub fn error_code(&self) -> Option<ToolErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// The JSON surfaced to the LLM as a tool-result message.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"ok": false}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_use_snake_case_on_the_wire() {
        let outcome = ToolOutcome::failure(ToolErrorCode::CircuitOpen, "cooling down", 0);
        let wire = outcome.to_wire();
        assert_eq!(wire["error"]["code"], "circuit_open");
        assert_eq!(wire["ok"], false);
        assert!(wire.get("result").is_none());
    }

    #[test]
    fn success_omits_error() {
        let outcome = ToolOutcome::success(serde_json::json!({"n": 3}), 12);
        let wire = outcome.to_wire();
        assert_eq!(wire["ok"], true);
        assert_eq!(wire["result"]["n"], 3);
        assert_eq!(wire["execution_ms"], 12);
        assert!(wire.get("error").is_none());
    }
}
