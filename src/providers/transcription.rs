//! OpenAI-compatible transcription client.
//!
//! One multipart POST per audio file. The cheap tier returns timed segments
//! (`verbose_json`); the mid and high tiers only return a text blob, so the
//! client synthesizes a single segment spanning the whole chunk. That
//! asymmetry is provider behavior and is preserved deliberately.

use crate::budget::{ApiProvider, RateBudget};
use crate::convert;
use crate::defaults;
use crate::error::{Result, ScrivanoError};
use crate::retry::{self, RetryExecutor};
use crate::types::{self, TranscriptionSegment};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Transcription model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranscriptionModel {
    /// Cheap and fast; the only tier that returns timed segments.
    #[default]
    WhisperV1,
    /// Balanced cost/quality; text blob only.
    Gpt4oMiniTranscribe,
    /// Highest accuracy; text blob only.
    Gpt4oTranscribe,
}

impl TranscriptionModel {
    /// Wire name sent in the `model` field.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::WhisperV1 => "whisper-1",
            Self::Gpt4oMiniTranscribe => "gpt-4o-mini-transcribe",
            Self::Gpt4oTranscribe => "gpt-4o-transcribe",
        }
    }

    /// Whether the provider supports `verbose_json` for this tier.
    pub fn supports_verbose_json(self) -> bool {
        matches!(self, Self::WhisperV1)
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "whisper-1" => Ok(Self::WhisperV1),
            "gpt-4o-mini-transcribe" => Ok(Self::Gpt4oMiniTranscribe),
            "gpt-4o-transcribe" => Ok(Self::Gpt4oTranscribe),
            other => Err(ScrivanoError::ConfigInvalidValue {
                key: "providers.transcription.model".to_string(),
                message: format!("unknown model '{other}'"),
            }),
        }
    }
}

/// Options for one transcription call.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub model: TranscriptionModel,
    /// Language code hint (e.g. "en", "de"); improves accuracy when known.
    pub language: Option<String>,
    /// Contextual prompt carried into the model.
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerboseResponse {
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    text: String,
}

/// Converts a verbose_json response into chunk-local segments.
pub(crate) fn parse_verbose_response(body: &str) -> Result<Vec<TranscriptionSegment>> {
    let response: VerboseResponse =
        serde_json::from_str(body).map_err(|e| ScrivanoError::Schema {
            message: format!("verbose_json response: {e}"),
        })?;

    let segments: Vec<_> = response
        .segments
        .into_iter()
        .map(|s| TranscriptionSegment {
            start: s.start,
            end: s.end,
            text: s.text,
            confidence: s.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0)),
            language: response.language.clone(),
        })
        .collect();
    types::validate_transcription(&segments)?;
    Ok(segments)
}

/// Converts a text-blob response into one segment covering the whole chunk.
pub(crate) fn parse_text_response(
    body: &str,
    chunk_duration: f64,
    language: Option<&str>,
) -> Result<Vec<TranscriptionSegment>> {
    let response: TextResponse = serde_json::from_str(body).map_err(|e| ScrivanoError::Schema {
        message: format!("json response: {e}"),
    })?;
    if response.text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![TranscriptionSegment {
        start: 0.0,
        end: chunk_duration,
        text: response.text,
        confidence: None,
        language: language.map(str::to_string),
    }])
}

/// Client for the transcription provider.
pub struct TranscriptionClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    budget: Arc<RateBudget>,
    retry: Arc<RetryExecutor>,
}

impl TranscriptionClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        budget: Arc<RateBudget>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            budget,
            retry,
        }
    }

    fn build_form(
        bytes: Vec<u8>,
        file_name: String,
        options: &TranscribeOptions,
    ) -> Result<reqwest::multipart::Form> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| ScrivanoError::Internal {
                message: format!("multipart assembly: {e}"),
            })?;

        let response_format = if options.model.supports_verbose_json() {
            "verbose_json"
        } else {
            "json"
        };

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", options.model.api_name().to_string())
            .text("response_format", response_format.to_string())
            .text("temperature", "0");

        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &options.prompt {
            form = form.text("prompt", prompt.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl super::SpeechToText for TranscriptionClient {
    async fn transcribe(
        &self,
        audio: &Path,
        options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>> {
        let meta = tokio::fs::metadata(audio).await?;
        if meta.len() > defaults::MAX_SINGLE_CALL_BYTES {
            return Err(ScrivanoError::Validation {
                message: format!(
                    "{} is {:.1} MB; the provider accepts at most 25 MB per call",
                    audio.display(),
                    meta.len() as f64 / (1024.0 * 1024.0)
                ),
            });
        }

        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();
        let timeout = retry::transcription_timeout(meta.len());
        let chunk_duration = convert::wav_duration_seconds(audio)?;

        tracing::debug!(
            file = %audio.display(),
            size_mb = meta.len() as f64 / (1024.0 * 1024.0),
            model = options.model.api_name(),
            "starting transcription call"
        );

        let body = self
            .retry
            .run(ApiProvider::Transcription, "transcribe", || {
                let bytes = bytes.clone();
                let file_name = file_name.clone();
                async move {
                    let _ticket = self.budget.acquire(ApiProvider::Transcription).await;
                    let form = Self::build_form(bytes, file_name, options)?;
                    let response = self
                        .http
                        .post(format!("{}/audio/transcriptions", self.base_url))
                        .bearer_auth(&self.token)
                        .timeout(timeout)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(|e| ScrivanoError::from_transport("transcription", e))?;

                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(ScrivanoError::from_status(
                            "transcription",
                            status.as_u16(),
                            text,
                        ));
                    }
                    response
                        .text()
                        .await
                        .map_err(|e| ScrivanoError::from_transport("transcription", e))
                }
            })
            .await?;

        let segments = if options.model.supports_verbose_json() {
            parse_verbose_response(&body)?
        } else {
            parse_text_response(&body, chunk_duration, options.language.as_deref())?
        };

        tracing::info!(
            segments = segments.len(),
            model = options.model.api_name(),
            "transcription call finished"
        );
        Ok(segments)
    }
}
