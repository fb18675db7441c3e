//! LLM backend client
//!
//! Implements the chat / streaming-chat / embeddings / JSON-mode contract
//! against an Ollama-compatible HTTP API. Streaming replies arrive as
//! newline-delimited JSON objects; the parser buffers partial lines across
//! network reads.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user" or "assistant"
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call options. `json_mode` forces the backend to emit a single JSON
/// object, used by the role classifier and intent extraction.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub json_mode: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),
    #[error("LLM returned status {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),
    #[error("LLM circuit breaker is open")]
    CircuitOpen,
}

/// Stream of assistant-reply text chunks.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Chat / embeddings contract required of the LLM backend.
///
/// Callers enforce cancellation by dropping the returned stream or racing it
/// with a token; implementations must not buffer the whole reply before
/// yielding the first chunk.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a chat exchange and return the full assistant reply.
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions)
        -> Result<String, LlmError>;

    /// Complete a chat exchange as a stream of reply chunks.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError>;

    /// Compute an embedding vector for the given text.
    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

// ==================== Ollama wire types ====================

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// HTTP client for an Ollama-compatible chat backend.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl OllamaClient {
    pub fn new(config: &config::LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        tracing::info!(
            base_url = %config.base_url,
            model = %config.model,
            "LLM client initialized"
        );

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn resolve_model<'a>(&'a self, options: &'a ChatOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.model)
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            Err(LlmError::ApiError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, LlmError> {
        let request = OllamaChatRequest {
            model: self.resolve_model(options),
            messages,
            stream: false,
            format: options.json_mode.then_some("json"),
            options: options.temperature.map(|t| OllamaOptions {
                temperature: Some(t),
            }),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let request = OllamaChatRequest {
            model: self.resolve_model(options),
            messages,
            stream: true,
            format: options.json_mode.then_some("json"),
            options: options.temperature.map(|t| OllamaOptions {
                temperature: Some(t),
            }),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        Ok(Box::pin(NdjsonChunkStream::new(
            response.bytes_stream().boxed(),
        )))
    }

    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let request = OllamaEmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        Ok(parsed.embedding)
    }
}

/// Buffered parser turning a byte stream of newline-delimited JSON chat
/// chunks into a stream of text deltas.
///
/// Multiple JSON objects can arrive in a single network read; partial lines
/// are carried over to the next read.
struct NdjsonChunkStream<S> {
    inner: S,
    buffer: String,
    pending: std::collections::VecDeque<Result<String, LlmError>>,
    done: bool,
}

impl<S> NdjsonChunkStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        }
    }

    fn process_buffer(&mut self) {
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer.drain(..=newline_pos).collect::<String>();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<OllamaChatResponse>(line) {
                Ok(chunk) => {
                    if let Some(message) = chunk.message {
                        if !message.content.is_empty() {
                            self.pending.push_back(Ok(message.content));
                        }
                    }
                    if chunk.done {
                        self.done = true;
                    }
                }
                Err(e) => {
                    self.pending
                        .push_back(Err(LlmError::ParseError(e.to_string())));
                }
            }
        }
    }
}

impl<S> Stream for NdjsonChunkStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<String, LlmError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return std::task::Poll::Ready(Some(item));
            }
            if self.done {
                return std::task::Poll::Ready(None);
            }

            match self.inner.poll_next_unpin(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => self.buffer.push_str(text),
                        Err(e) => {
                            return std::task::Poll::Ready(Some(Err(LlmError::ParseError(
                                format!("Invalid UTF-8 in stream: {e}"),
                            ))))
                        }
                    }
                    self.process_buffer();
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(Err(LlmError::RequestFailed(
                        e.to_string(),
                    ))));
                }
                std::task::Poll::Ready(None) => {
                    // Flush any trailing line without a newline
                    if !self.buffer.is_empty() {
                        self.buffer.push('\n');
                        self.process_buffer();
                        if let Some(item) = self.pending.pop_front() {
                            return std::task::Poll::Ready(Some(item));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}
