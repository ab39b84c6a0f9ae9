//! Scripted mock provider for tests and examples.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::ProviderError;
use super::keys::ApiKey;
use super::{DeltaStream, FinishReason, LlmRequest, LlmResponse, Provider, TextDelta};

/// One scripted outcome, consumed in FIFO order.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// `call` succeeds with this content; `stream` yields it as one delta.
    Succeed(String),
    /// Fails with this message (classified by the dispatcher as usual).
    Fail(String),
    /// `stream` yields these chunks then ends.
    StreamChunks(Vec<String>),
    /// `stream` yields these chunks, then errors. An empty chunk list makes
    /// the error arrive before the first delta (failover-eligible).
    StreamChunksThenFail(Vec<String>, String),
}

/// A provider driven by a queue of [`MockOutcome`]s. When the queue is empty
/// every call succeeds with `"ok"`. Records every `(model, key_id)` pair it
/// was invoked with.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// `(model, key_id)` pairs, in invocation order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| MockOutcome::Succeed("ok".to_string()))
    }

    fn note_call(&self, model: &str, key: &ApiKey) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((model.to_string(), key.id.clone()));
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        _req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        self.note_call(model, key);
        match self.next_outcome() {
            MockOutcome::Succeed(content) => Ok(LlmResponse {
                content,
                finish_reason: FinishReason::Stop,
                ..Default::default()
            }),
            MockOutcome::Fail(message) => Err(ProviderError::classified(&self.name, message)),
            MockOutcome::StreamChunks(chunks) => Ok(LlmResponse {
                content: chunks.concat(),
                finish_reason: FinishReason::Stop,
                ..Default::default()
            }),
            MockOutcome::StreamChunksThenFail(_, message) => {
                Err(ProviderError::classified(&self.name, message))
            }
        }
    }

    async fn stream(
        &self,
        _req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        self.note_call(model, key);
        let (chunks, fail): (Vec<String>, Option<String>) = match self.next_outcome() {
            MockOutcome::Succeed(content) => (vec![content], None),
            MockOutcome::Fail(message) => {
                return Err(ProviderError::classified(&self.name, message))
            }
            MockOutcome::StreamChunks(chunks) => (chunks, None),
            MockOutcome::StreamChunksThenFail(chunks, message) => (chunks, Some(message)),
        };

        let provider = self.name.clone();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for text in chunks {
                if tx.send(Ok(TextDelta { text })).await.is_err() {
                    return;
                }
            }
            if let Some(message) = fail {
                let _ = tx.send(Err(ProviderError::classified(provider, message))).await;
            }
        });
        Ok(DeltaStream::from_channel(rx))
    }
}
