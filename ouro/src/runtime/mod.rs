//! Runtime dispatcher: LLM invocation with provider abstraction, streaming,
//! error classification, multi-key auth rotation, and provider failover.
//!
//! A [`Provider`] offers exactly two operations, `call` and `stream`.
//! Providers never retry internally and never rotate keys; the
//! [`Dispatcher`] owns those policies, walking an ordered failover chain of
//! `(provider, model)` pairs and classifying every failure via
//! [`ErrorClass::classify`].

mod dispatcher;
mod error;
mod http;
mod keys;
mod mock;

pub use dispatcher::{AttemptRecord, ChainEntry, Dispatcher, DispatcherBuilder, MetricsSink};
pub use error::{DispatchError, ErrorClass, ProviderError};
pub use http::HttpProvider;
pub use keys::{ApiKey, KeyRing, ProviderHealth};
pub use mock::{MockOutcome, MockProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::pipeline::ToolCall;

/// A normalized LLM request, independent of any provider wire format.
#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    /// Free-form task label (e.g. `"chat"`, `"code_analysis"`); used for
    /// model preference lookup and recorded on attempt metrics.
    pub task_type: String,
    /// The new prompt for this turn.
    pub prompt: String,
    /// Prior conversation context, oldest first.
    pub context: Vec<Message>,
    /// Preferred model: either `"provider:model"` or a bare model name that
    /// is resolved against the failover chain.
    pub preferred_model: Option<String>,
    pub max_tokens: Option<u32>,
    /// Tool definitions offered to the model for this call.
    pub tools: Vec<ToolDef>,
}

/// A tool offered to the LLM: name, description, and a JSON-schema-shaped
/// parameter object (built from the pipeline's declarative schema).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage for one LLM call.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other(String),
}

impl Default for FinishReason {
    fn default() -> Self {
        FinishReason::Stop
    }
}

/// A complete (non-streaming) LLM response.
///
/// **Interaction**: returned by [`Dispatcher::dispatch`]; the chat glue reads
/// `tool_calls` to drive the serialized tool loop.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
    /// Which `(provider, model)` actually answered, after any failover.
    pub provider: String,
    pub model: String,
}

/// One text fragment from a streaming response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

/// A finite, non-restartable sequence of text deltas.
///
/// Terminates either normally (`None`) or with an error item; an error is
/// always the last item yielded. Streams are backed by an mpsc channel fed by
/// the provider task, so dropping the stream aborts the producer side.
pub struct DeltaStream {
    buffered: VecDeque<TextDelta>,
    rx: mpsc::Receiver<Result<TextDelta, ProviderError>>,
    done: bool,
}

impl DeltaStream {
    /// Builds a stream from a channel; the provider task holds the sender.
    pub fn from_channel(rx: mpsc::Receiver<Result<TextDelta, ProviderError>>) -> Self {
        Self {
            buffered: VecDeque::new(),
            rx,
            done: false,
        }
    }

    /// Re-queues a delta already pulled off the channel (the dispatcher peeks
    /// at the first item to decide whether failover is still allowed).
    pub(crate) fn push_front(&mut self, delta: TextDelta) {
        self.buffered.push_front(delta);
    }

    /// Next delta, `Some(Err(_))` exactly once on failure, `None` at the end.
    pub async fn next(&mut self) -> Option<Result<TextDelta, ProviderError>> {
        if let Some(d) = self.buffered.pop_front() {
            return Some(Ok(d));
        }
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(d)) => Some(Ok(d)),
            Some(Err(e)) => {
                self.done = true;
                self.rx.close();
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Drains the remaining deltas into one string, stopping at the first
    /// error (which is returned).
    pub async fn collect_text(mut self) -> Result<String, ProviderError> {
        let mut out = String::new();
        while let Some(item) = self.next().await {
            out.push_str(&item?.text);
        }
        Ok(out)
    }
}

impl futures::Stream for DeltaStream {
    type Item = Result<TextDelta, ProviderError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        let this = self.get_mut();
        if let Some(d) = this.buffered.pop_front() {
            return Poll::Ready(Some(Ok(d)));
        }
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(d))) => Poll::Ready(Some(Ok(d))),
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                this.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An LLM provider: one non-streaming call and one streaming call.
///
/// Implementations map their wire format into [`LlmResponse`] /
/// [`DeltaStream`] and surface failures as [`ProviderError`] with a message
/// suitable for substring classification. They must honor `cancel` promptly
/// at every suspension point, never retry internally, and never rotate keys.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError>;

    async fn stream(
        &self,
        req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, ProviderError>;
}
