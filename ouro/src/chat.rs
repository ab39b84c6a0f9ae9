//! Chat intake: context assembly and the serialized tool loop.
//!
//! One [`ChatTurn::run`] call persists the user message, assembles context
//! from memory (recent messages plus keyword recall), dispatches to the LLM,
//! and while the response carries tool calls, executes them one at a time
//! through the pipeline; each result is persisted as a `tool` message and
//! fed back before the next LLM step. Cancellation stops further work but
//! never undoes persisted messages.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::memory::{MemoryEngine, MemoryError};
use crate::message::Message;
use crate::pipeline::ToolPipeline;
use crate::runtime::{DispatchError, Dispatcher, LlmRequest};

/// Tuning for a chat turn.
#[derive(Clone, Debug)]
pub struct ChatTurnOptions {
    /// Upper bound on LLM steps per turn (each step may carry tool calls).
    pub max_tool_rounds: usize,
    /// How many trailing conversation messages ride along as context.
    pub recent_limit: usize,
    /// How many keyword-recall hits are folded into the first prompt.
    pub recall_limit: usize,
}

impl Default for ChatTurnOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            recent_limit: 40,
            recall_limit: 5,
        }
    }
}

/// Result of one turn.
#[derive(Clone, Debug)]
pub struct ChatOutcome {
    /// Final assistant reply; `None` when the turn was cancelled before one.
    pub reply: Option<String>,
    /// LLM steps taken.
    pub rounds: usize,
    /// Clearly marked cancellation; not an error.
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// The glue between memory, dispatcher, and pipeline.
pub struct ChatTurn {
    memory: Arc<MemoryEngine>,
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<ToolPipeline>,
    options: ChatTurnOptions,
}

impl ChatTurn {
    pub fn new(
        memory: Arc<MemoryEngine>,
        dispatcher: Arc<Dispatcher>,
        pipeline: Arc<ToolPipeline>,
    ) -> Self {
        Self {
            memory,
            dispatcher,
            pipeline,
            options: ChatTurnOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChatTurnOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs one user turn against a conversation.
    pub async fn run(
        &self,
        conversation_id: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, ChatError> {
        let stored = self
            .memory
            .store_message(conversation_id, &Message::user(user_text))
            .await?;
        let user_msg_id = stored.id.clone();

        let prompt = self.prompt_with_recall(user_text).await;
        let tools = self.pipeline.registry().tool_defs();
        let mut rounds = 0usize;
        let mut last_reply: Option<String> = None;

        while rounds < self.options.max_tool_rounds {
            if cancel.is_cancelled() {
                return Ok(ChatOutcome {
                    reply: None,
                    rounds,
                    cancelled: true,
                });
            }

            let context = self.recent_context(conversation_id, &user_msg_id).await?;
            let request = LlmRequest {
                task_type: "chat".to_string(),
                prompt: prompt.clone(),
                context,
                preferred_model: None,
                max_tokens: None,
                tools: tools.clone(),
            };

            let response = match self.dispatcher.dispatch(&request, cancel).await {
                Ok(r) => r,
                Err(DispatchError::Cancelled) => {
                    return Ok(ChatOutcome {
                        reply: None,
                        rounds,
                        cancelled: true,
                    });
                }
                Err(e) => return Err(e.into()),
            };
            rounds += 1;

            let mut assistant = Message::assistant(&response.content);
            if !response.tool_calls.is_empty() {
                assistant = assistant.with_metadata(serde_json::json!({
                    "tool_calls": response.tool_calls,
                }));
            }
            self.memory
                .store_message(conversation_id, &assistant)
                .await?;
            last_reply = Some(response.content.clone());

            if response.tool_calls.is_empty() {
                return Ok(ChatOutcome {
                    reply: last_reply,
                    rounds,
                    cancelled: false,
                });
            }

            // Tool calls within a turn are serialized: each result lands in
            // the conversation before the next call runs.
            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Ok(ChatOutcome {
                        reply: None,
                        rounds,
                        cancelled: true,
                    });
                }
                debug!(tool = call.tool_name.as_str(), "turn executing tool call");
                let outcome = self.pipeline.execute(call, cancel).await;
                let tool_msg = Message::tool(outcome.to_wire().to_string()).with_metadata(
                    serde_json::json!({
                        "tool_name": call.tool_name,
                        "trace_id": call.trace_id,
                    }),
                );
                self.memory.store_message(conversation_id, &tool_msg).await?;
            }
        }

        Ok(ChatOutcome {
            reply: last_reply,
            rounds,
            cancelled: false,
        })
    }

    /// First-round prompt: the user text plus a recall section from keyword
    /// search, when anything relevant surfaces.
    async fn prompt_with_recall(&self, user_text: &str) -> String {
        if self.options.recall_limit == 0 {
            return user_text.to_string();
        }
        let recall = match self
            .memory
            .search_conversations(user_text, self.options.recall_limit)
            .await
        {
            Ok(response) => response.hits,
            Err(e) => {
                debug!("recall search failed, continuing without: {e}");
                Vec::new()
            }
        };
        if recall.is_empty() {
            return user_text.to_string();
        }
        let mut prompt = String::from("Relevant prior context:\n");
        for hit in &recall {
            prompt.push_str("- ");
            prompt.push_str(&hit.content);
            prompt.push('\n');
        }
        prompt.push('\n');
        prompt.push_str(user_text);
        prompt
    }

    /// Trailing conversation context, excluding the turn's own user message
    /// (it travels as the prompt).
    async fn recent_context(
        &self,
        conversation_id: &str,
        user_msg_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let stored = self
            .memory
            .list_messages(conversation_id, self.options.recent_limit)
            .await?;
        Ok(stored
            .into_iter()
            .filter(|m| m.id != user_msg_id)
            .map(|m| Message {
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
                token_estimate: m.token_estimate,
                metadata: m.metadata,
            })
            .collect())
    }
}
