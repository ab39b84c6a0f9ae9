//! OpenAI-compatible HTTP provider.
//!
//! Speaks the `/chat/completions` wire shape over any base URL, so one
//! implementation covers every OpenAI-compatible endpoint. Non-streaming POST
//! plus SSE streaming; HTTP status and body are folded into the error message
//! so [`ErrorClass::classify`](super::ErrorClass::classify) can do its job.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::Role;
use crate::pipeline::ToolCall;

use super::error::ProviderError;
use super::keys::ApiKey;
use super::{DeltaStream, FinishReason, LlmRequest, LlmResponse, Provider, TextDelta, Usage};

/// OpenAI-compatible chat-completions client.
pub struct HttpProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvider {
    /// `base_url` up to and including the version segment, e.g.
    /// `https://api.openai.com/v1` or `http://localhost:11434/v1`.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn err(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::classified(&self.name, message)
    }

    fn build_body(&self, req: &LlmRequest, model: &str, stream: bool) -> WireRequest {
        let mut messages: Vec<WireMessage> = req
            .context
            .iter()
            .map(|m| WireMessage {
                role: wire_role(m.role),
                content: Some(m.content.clone()),
            })
            .collect();
        messages.push(WireMessage {
            role: "user",
            content: Some(req.prompt.clone()),
        });

        let tools = if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: WireFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        WireRequest {
            model: model.to_string(),
            messages,
            max_tokens: req.max_tokens,
            stream,
            tools,
        }
    }

    async fn send(
        &self,
        body: &WireRequest,
        key: &ApiKey,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let fut = self
            .client
            .post(self.endpoint())
            .bearer_auth(&key.secret)
            .json(body)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(self.err("request cancelled")),
            r = fut => r.map_err(|e| self.err(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.err(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let body = self.build_body(req, model, false);
        let response = self.send(&body, key, cancel).await?;
        let parsed: WireResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(self.err("request cancelled")),
            r = response.json() => r.map_err(|e| self.err(format!("decode response: {e}")))?,
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.err("response contained no choices"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let args = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null);
                ToolCall {
                    tool_name: tc.function.name,
                    args,
                    trace_id: tc.id,
                }
            })
            .collect::<Vec<_>>();

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") | None => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason,
            provider: self.name.clone(),
            model: model.to_string(),
        })
    }

    async fn stream(
        &self,
        req: &LlmRequest,
        model: &str,
        key: &ApiKey,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        let body = self.build_body(req, model, true);
        let response = self.send(&body, key, cancel).await?;

        let (tx, rx) = mpsc::channel(32);
        let provider = self.name.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    e = events.next() => e,
                };
                let Some(event) = event else { break };
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::classified(&provider, e.to_string())))
                            .await;
                        break;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: WireChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(provider = provider.as_str(), "skipping undecodable sse chunk: {e}");
                        continue;
                    }
                };
                let Some(text) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                else {
                    continue;
                };
                if !text.is_empty() && tx.send(Ok(TextDelta { text })).await.is_err() {
                    break;
                }
            }
        });

        Ok(DeltaStream::from_channel(rx))
    }
}

// ---- wire DTOs ------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolCallFunction,
}

#[derive(Deserialize)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
}

#[derive(Deserialize)]
struct WireDelta {
    content: Option<String>,
}
