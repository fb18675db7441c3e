//! Speech-to-text client
//!
//! Sends canonical WAV blobs to the transcription service and returns the
//! recognized text, optionally with an identified speaker.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("STT request failed: {0}")]
    RequestFailed(String),
    #[error("STT returned status {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse STT response: {0}")]
    ParseError(String),
    #[error("STT circuit breaker is open")]
    CircuitOpen,
}

/// Result of a transcription call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub speaker_alias: Option<String>,
    #[serde(default)]
    pub speaker_confidence: f32,
}

/// Contract required of the speech-to-text engine.
#[async_trait]
pub trait SttClient: Send + Sync {
    /// Transcribe a WAV-framed audio blob.
    async fn transcribe(
        &self,
        wav_bytes: Vec<u8>,
        language: Option<&str>,
    ) -> Result<Transcription, SttError>;

    /// Transcribe and additionally try to identify the speaker against the
    /// enrolled voice profiles. Implementations without speaker support fall
    /// back to plain transcription.
    async fn transcribe_with_speaker(
        &self,
        wav_bytes: Vec<u8>,
        language: Option<&str>,
    ) -> Result<Transcription, SttError> {
        self.transcribe(wav_bytes, language).await
    }
}

/// HTTP client for the transcription service.
pub struct HttpSttClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSttClient {
    pub fn new(config: &config::SttConfig) -> Result<Self, SttError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SttError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        tracing::info!(base_url = %config.base_url, "STT client initialized");

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    async fn post_audio(
        &self,
        path: &str,
        wav_bytes: Vec<u8>,
        language: Option<&str>,
    ) -> Result<Transcription, SttError> {
        let part = reqwest::multipart::Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttError::RequestFailed(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SttError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(SttError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Transcription>()
            .await
            .map_err(|e| SttError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(
        &self,
        wav_bytes: Vec<u8>,
        language: Option<&str>,
    ) -> Result<Transcription, SttError> {
        self.post_audio("/transcribe", wav_bytes, language).await
    }

    async fn transcribe_with_speaker(
        &self,
        wav_bytes: Vec<u8>,
        language: Option<&str>,
    ) -> Result<Transcription, SttError> {
        self.post_audio("/transcribe_with_speaker", wav_bytes, language)
            .await
    }
}
