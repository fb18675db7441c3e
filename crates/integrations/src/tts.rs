//! Text-to-speech client

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("TTS request failed: {0}")]
    RequestFailed(String),
    #[error("TTS returned status {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("TTS circuit breaker is open")]
    CircuitOpen,
}

/// Contract required of the speech-synthesis engine.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Synthesize speech audio for the given text. Returns encoded audio
    /// bytes ready to forward to a device.
    async fn synthesize(&self, text: &str, language: Option<&str>) -> Result<Vec<u8>, TtsError>;
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

/// HTTP client for the synthesis service.
pub struct HttpTtsClient {
    client: reqwest::Client,
    base_url: String,
    voice: Option<String>,
}

impl HttpTtsClient {
    pub fn new(config: &config::TtsConfig) -> Result<Self, TtsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TtsError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        tracing::info!(base_url = %config.base_url, "TTS client initialized");

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            voice: config.voice.clone(),
        })
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize(&self, text: &str, language: Option<&str>) -> Result<Vec<u8>, TtsError> {
        let request = SynthesizeRequest {
            text,
            language,
            voice: self.voice.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| TtsError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(TtsError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TtsError::RequestFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
