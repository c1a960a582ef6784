//! Speech synthesis client (OpenAI audio speech).
//!
//! The whole audio payload is buffered in memory before it is returned; this is fine
//! for the short utterances a capped generation produces, but it is a scaling limit
//! for long texts.

use super::endpoint;
use crate::config::BackendConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Encoding of a synthesized audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
}

impl AudioFormat {
    /// Value of the backend's `response_format` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResponse {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
}

/// Anything that turns text into encoded audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Make exactly one backend call. Failures come back as `RelayError::Synthesis`.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisResponse, RelayError>;
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

/// Synthesis client for any OpenAI-compatible `/audio/speech` endpoint.
pub struct OpenAiSpeechSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    voice: String,
    format: AudioFormat,
}

impl OpenAiSpeechSynthesizer {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: endpoint(&config.base_url, "audio/speech"),
            api_key: config.api_key.clone(),
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            format: AudioFormat::Mp3,
        })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: text,
            response_format: self.format.as_str(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisResponse, RelayError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request.text))
            .send()
            .await
            .map_err(|e| RelayError::synthesis_caused_by("request to synthesis backend failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::synthesis(format!(
                "synthesis backend returned {}: {}",
                status, body
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| RelayError::synthesis_caused_by("failed to read synthesized audio", e))?;
        if audio.is_empty() {
            return Err(RelayError::synthesis("synthesis backend returned an empty audio payload"));
        }

        debug!(voice = %self.voice, bytes = audio.len(), "Synthesis completed");

        Ok(SynthesisResponse {
            audio: audio.to_vec(),
            format: self.format,
        })
    }
}
