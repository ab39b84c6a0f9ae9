//! Conversation message types.
//!
//! A [`Message`] is one turn in a conversation: a role, text content, an
//! epoch-millisecond timestamp, and optional metadata. This is the shape that
//! is appended to the conversation log and mirrored into the indexed store;
//! readers must ignore unknown fields, which serde does by default.

use serde::{Deserialize, Serialize};

/// Role of a conversation turn.
///
/// Serialized lowercase on the wire and in the log (`"user"`, `"assistant"`,
/// `"tool"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Lowercase wire name, used when building chunk text (`"{role}: {content}"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn in a conversation.
///
/// **Interaction**: appended to the conversation log by
/// [`MemoryEngine::store_message`](crate::memory::MemoryEngine::store_message),
/// read back for context assembly, and carried in
/// [`LlmRequest::context`](crate::runtime::LlmRequest).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Rough token count when known; used for context budgeting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            token_estimate: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
