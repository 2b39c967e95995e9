//! Remote completion service.
//!
//! Defines the [`CompletionClient`] trait the dispatcher talks to, and
//! [`OpenAiCompatClient`], an implementation for OpenAI-compatible
//! `/chat/completions` endpoints (DashScope compatible mode in particular)
//! that streams server-sent events with a separate reasoning channel.
//!
//! # Stream format
//!
//! ```text
//! data: {"choices":[{"delta":{"reasoning_content":"..."}}]}
//! data: {"choices":[{"delta":{"content":"..."}}]}
//! data: [DONE]
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::DispatchError;

/// One role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A streamed completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Ask the service for its auxiliary reasoning channel.
    pub enable_thinking: bool,
    pub stream: bool,
    #[serde(skip)]
    pub timeout: Duration,
}

/// One increment of a streamed response. Either channel may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub reasoning: Option<String>,
    pub content: Option<String>,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, DispatchError>> + Send>>;

/// A text-completion service that streams its answer.
///
/// Implementations must be safe to call concurrently; the dispatcher
/// bounds how many calls are in flight.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Start a streamed completion. Errors here are failures to start the
    /// call; errors while consuming the stream arrive as stream items.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, DispatchError>;
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build a client from config, reading the API key from the environment.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        Self::new(config.base_url.clone(), config.api_key()?)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream, DispatchError> {
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        // A saturated timeout means no per-request deadline.
        if request.timeout != Duration::MAX {
            builder = builder.timeout(request.timeout);
        }
        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "completion request rejected");
            return Err(DispatchError::Api {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let timeout = request.timeout;
        Ok(Box::pin(SseDeltaStream::new(response.bytes_stream(), timeout)))
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunkRaw {
    #[serde(default)]
    choices: Vec<StreamChoiceRaw>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoiceRaw {
    #[serde(default)]
    delta: Option<DeltaRaw>,
}

#[derive(Debug, Deserialize)]
struct DeltaRaw {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Converts a raw SSE byte stream into [`StreamDelta`] values.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
pub struct SseDeltaStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    timeout: Duration,
    done: bool,
}

impl SseDeltaStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            timeout,
            done: false,
        }
    }
}

impl Stream for SseDeltaStream {
    type Item = Result<StreamDelta, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            match next_event(&mut this.buffer, false) {
                Some(SseEvent::Delta(delta)) => return Poll::Ready(Some(Ok(delta))),
                Some(SseEvent::Done) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Some(SseEvent::Error(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {}
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(DispatchError::from_reqwest(e, this.timeout))));
                }
                Poll::Ready(None) => {
                    // Unterminated trailing line.
                    this.done = true;
                    return match next_event(&mut this.buffer, true) {
                        Some(SseEvent::Delta(delta)) => Poll::Ready(Some(Ok(delta))),
                        Some(SseEvent::Error(e)) => Poll::Ready(Some(Err(e))),
                        Some(SseEvent::Done) | None => Poll::Ready(None),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum SseEvent {
    Delta(StreamDelta),
    Done,
    Error(DispatchError),
}

/// Take lines off the buffer until one yields an event. With `eof`, the
/// remaining bytes count as a final line.
fn next_event(buffer: &mut Vec<u8>, eof: bool) -> Option<SseEvent> {
    loop {
        let line: Vec<u8> = match buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => buffer.drain(..=pos).collect(),
            None if eof && !buffer.is_empty() => std::mem::take(buffer),
            None => return None,
        };

        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // Only data lines matter; skip "event:", "id:", "retry:" and comments.
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }

        return Some(match serde_json::from_str::<StreamChunkRaw>(data) {
            Ok(StreamChunkRaw {
                error: Some(err), ..
            }) => SseEvent::Error(DispatchError::Stream(format!(
                "service error in stream: {}",
                err
            ))),
            Ok(raw) => {
                let delta = raw
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .map(|d| StreamDelta {
                        reasoning: d.reasoning_content,
                        content: d.content,
                    })
                    .unwrap_or_default();
                SseEvent::Delta(delta)
            }
            Err(e) => SseEvent::Error(DispatchError::Stream(format!(
                "failed to parse stream chunk: {} (data: {})",
                e,
                truncate(data, 200)
            ))),
        });
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
