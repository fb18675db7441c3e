//! Audio pipeline
//!
//! Turns a finished listening session into a transcript: assemble the
//! buffered PCM, frame it as canonical WAV (mono, 16-bit, 16 kHz) and hand
//! it to the STT engine, optionally with speaker identification. The caller
//! ends the session when a stage fails; this module only reports the reason.

use crate::common::CircuitBreaker;
use crate::protocol::ServerFrame;
use crate::registry::{DeviceRegistry, SessionSink};
use integrations::{SttClient, Transcription};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the pipeline could not produce a transcript; doubles as the
/// `session_end` reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineFailure {
    EmptyAudio,
    EmptyTranscription,
    TranscriptionError,
    Cancelled,
}

impl PipelineFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineFailure::EmptyAudio => "empty_audio",
            PipelineFailure::EmptyTranscription => "empty_transcription",
            PipelineFailure::TranscriptionError => "transcription_error",
            PipelineFailure::Cancelled => "cancelled",
        }
    }
}

/// Frame raw PCM into the canonical 44-byte WAV container: RIFF, mono,
/// 16-bit signed little-endian.
pub fn wrap_pcm_in_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    const CHANNELS: u16 = 1;
    const BITS_PER_SAMPLE: u16 = 16;
    let byte_rate = sample_rate * u32::from(CHANNELS) * u32::from(BITS_PER_SAMPLE) / 8;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

pub struct AudioPipeline {
    registry: Arc<DeviceRegistry>,
    stt: Arc<dyn SttClient>,
    stt_breaker: Arc<CircuitBreaker>,
    speaker_recognition: bool,
    language: Option<String>,
    sample_rate: u32,
}

impl AudioPipeline {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        stt: Arc<dyn SttClient>,
        stt_breaker: Arc<CircuitBreaker>,
        stt_config: &config::SttConfig,
        audio_config: &config::AudioConfig,
    ) -> Self {
        Self {
            registry,
            stt,
            stt_breaker,
            speaker_recognition: stt_config.speaker_recognition_enabled,
            language: stt_config.language.clone(),
            sample_rate: audio_config.sample_rate,
        }
    }

    /// Assemble the session's audio, transcribe it and emit the
    /// `transcription` frame. The session is expected to be in
    /// `processing` already.
    pub async fn transcribe_session(
        &self,
        session_id: &str,
        sink: &SessionSink,
        cancel: &CancellationToken,
    ) -> Result<Transcription, PipelineFailure> {
        let (pcm, has_gaps) = self
            .registry
            .get_audio(session_id)
            .await
            .map_err(|_| PipelineFailure::Cancelled)?;
        if pcm.is_empty() {
            warn!(session_id = %session_id, "No audio buffered");
            return Err(PipelineFailure::EmptyAudio);
        }
        if has_gaps {
            warn!(session_id = %session_id, "Transcribing audio with sequence gaps");
        }

        let wav = wrap_pcm_in_wav(&pcm, self.sample_rate);
        info!(
            session_id = %session_id,
            pcm_bytes = pcm.len(),
            "Audio assembled for transcription"
        );

        if !self.stt_breaker.check() {
            warn!(session_id = %session_id, "STT circuit breaker open");
            return Err(PipelineFailure::TranscriptionError);
        }

        let language = self.language.as_deref();
        let stt_call = async {
            if self.speaker_recognition {
                self.stt.transcribe_with_speaker(wav, language).await
            } else {
                self.stt.transcribe(wav, language).await
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineFailure::Cancelled),
            result = stt_call => result,
        };

        let transcription = match result {
            Ok(transcription) => {
                self.stt_breaker.record_success();
                transcription
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Transcription failed");
                self.stt_breaker.record_failure();
                return Err(PipelineFailure::TranscriptionError);
            }
        };

        if transcription.text.trim().is_empty() {
            return Err(PipelineFailure::EmptyTranscription);
        }

        if let Err(e) = self
            .registry
            .set_transcript(session_id, transcription.text.clone())
            .await
        {
            warn!(session_id = %session_id, error = %e, "Could not record transcript");
        }

        info!(session_id = %session_id, text = %transcription.text, "Transcription complete");
        sink.send(ServerFrame::Transcription {
            session_id: session_id.to_string(),
            text: transcription.text.clone(),
            speaker_name: transcription.speaker_name.clone(),
            speaker_alias: transcription.speaker_alias.clone(),
        });

        Ok(transcription)
    }
}
