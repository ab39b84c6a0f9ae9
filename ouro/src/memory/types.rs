//! Durable record types for the memory engine.

use serde::{Deserialize, Serialize};

use crate::message::Role;

/// A durable chat thread. Created on first turn, never auto-deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    /// Epoch ms.
    pub created_at: i64,
    pub updated_at: i64,
    /// SHA-256 of the conversation's log file, maintained by reconciliation.
    pub content_hash: Option<String>,
}

/// A message as mirrored in the indexed store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    pub token_estimate: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

/// A recorded choice with its reasoning and (eventually) its outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub timestamp: i64,
    pub context: String,
    pub reasoning: String,
    pub alternatives: Vec<String>,
    pub chosen: String,
    pub outcome: Option<String>,
    pub lessons: Option<String>,
}

/// One immutable metric data point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub timestamp: i64,
    pub metric_type: String,
    pub name: String,
    pub value: f64,
    pub context: Option<String>,
}

impl Metric {
    pub fn now(
        metric_type: impl Into<String>,
        name: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metric_type: metric_type.into(),
            name: name.into(),
            value,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A reusable recipe; success/failure counts are fed back by outcomes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub category: String,
    pub problem: String,
    pub solution: String,
    pub success_count: u32,
    pub failure_count: u32,
}

/// A scanned source file, keyed by repo-relative path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeFile {
    pub path: String,
    pub repo: String,
    pub language: String,
    pub size: u64,
    /// SHA-256 of the file bytes; drives incremental re-index.
    pub hash: String,
    pub last_modified: i64,
}
