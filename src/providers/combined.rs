//! Combined diarization+transcription client (prediction-style API).
//!
//! One remote call returns speakers and text together in absolute time,
//! bypassing the upload/diarize/transcribe/fuse path entirely. The provider
//! runs predictions: submit inputs, poll the prediction until terminal.

use crate::budget::{ApiProvider, RateBudget};
use crate::error::{Result, ScrivanoError};
use crate::retry::{self, RetryExecutor};
use crate::types::{self, FusedSegment};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Options for a combined run.
#[derive(Debug, Clone, Default)]
pub struct CombinedOptions {
    pub language: Option<String>,
    /// Speaker-count hint; the provider infers it when absent.
    pub num_speakers: Option<u32>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputSegment {
    start: f64,
    end: f64,
    speaker: String,
    text: String,
}

/// Extracts absolute-time segments from a terminal prediction output.
///
/// The model wraps them as `{"segments": [...]}`; a bare array is tolerated.
pub(crate) fn parse_prediction_output(output: &serde_json::Value) -> Result<Vec<FusedSegment>> {
    let list = output.get("segments").unwrap_or(output);
    let raw: Vec<OutputSegment> =
        serde_json::from_value(list.clone()).map_err(|e| ScrivanoError::Schema {
            message: format!("prediction output: {e}"),
        })?;

    let segments: Vec<_> = raw
        .into_iter()
        .map(|s| FusedSegment {
            start: s.start,
            end: s.end,
            speaker: s.speaker.clone(),
            text: s.text,
            confidence: None,
            diarization_speaker: Some(s.speaker),
            identified_as: None,
            match_score: None,
        })
        .collect();
    types::validate_fused(&segments)?;
    Ok(segments)
}

/// Client for the combined provider.
pub struct CombinedClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    model_version: String,
    budget: Arc<RateBudget>,
    retry: Arc<RetryExecutor>,
    poll_interval: Duration,
}

impl CombinedClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        model_version: impl Into<String>,
        budget: Arc<RateBudget>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            model_version: model_version.into(),
            budget,
            retry,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Shortens the poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn request(&self, operation: &str, build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder + Sync) -> Result<PredictionResponse> {
        self.retry
            .run(ApiProvider::Combined, operation, || async {
                let _ticket = self.budget.acquire(ApiProvider::Combined).await;
                let response = build(&self.http)
                    .bearer_auth(&self.token)
                    .timeout(retry::default_call_timeout())
                    .send()
                    .await
                    .map_err(|e| ScrivanoError::from_transport("combined", e))?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ScrivanoError::from_status("combined", status.as_u16(), text));
                }
                response
                    .json::<PredictionResponse>()
                    .await
                    .map_err(|e| ScrivanoError::Schema {
                        message: format!("prediction response: {e}"),
                    })
            })
            .await
    }

    async fn submit(&self, audio: &Path, options: &CombinedOptions) -> Result<PredictionResponse> {
        let bytes = tokio::fs::read(audio).await?;
        let file_url = format!(
            "data:audio/wav;base64,{}",
            BASE64_STANDARD.encode(&bytes)
        );

        let mut input = json!({ "file_url": file_url });
        if let Some(language) = &options.language {
            input["language"] = json!(language);
        }
        if let Some(num_speakers) = options.num_speakers {
            input["num_speakers"] = json!(num_speakers);
        }
        if let Some(prompt) = &options.prompt {
            input["prompt"] = json!(prompt);
        }
        let body = json!({ "version": self.model_version, "input": input });

        self.request("submit_prediction", move |http| {
            http.post(format!("{}/predictions", self.base_url))
                .json(&body)
        })
        .await
    }

    async fn poll_until_done(&self, prediction_id: &str) -> Result<serde_json::Value> {
        loop {
            let prediction = self
                .request("poll_prediction", |http| {
                    http.get(format!("{}/predictions/{prediction_id}", self.base_url))
                })
                .await?;

            if prediction.status.is_terminal() {
                return match prediction.status {
                    PredictionStatus::Succeeded => {
                        prediction.output.ok_or_else(|| ScrivanoError::Schema {
                            message: format!("prediction {prediction_id} succeeded without output"),
                        })
                    }
                    _ => Err(ScrivanoError::Provider {
                        provider: "combined".to_string(),
                        status: 0,
                        message: format!(
                            "prediction {prediction_id} ended as {:?}: {}",
                            prediction.status,
                            prediction.error.unwrap_or_default()
                        ),
                    }),
                };
            }
            tracing::debug!(prediction_id, status = ?prediction.status, "prediction still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl super::CombinedPipeline for CombinedClient {
    async fn diarize_and_transcribe(
        &self,
        audio: &Path,
        options: &CombinedOptions,
    ) -> Result<Vec<FusedSegment>> {
        let prediction = self.submit(audio, options).await?;
        tracing::info!(prediction_id = %prediction.id, "combined prediction submitted");

        let output = if prediction.status.is_terminal() {
            prediction.output.ok_or_else(|| ScrivanoError::Schema {
                message: "prediction finished without output".to_string(),
            })?
        } else {
            self.poll_until_done(&prediction.id).await?
        };

        let segments = parse_prediction_output(&output)?;
        tracing::info!(segments = segments.len(), "combined run finished");
        Ok(segments)
    }
}

/// Mock combined pipeline for tests.
pub struct MockCombinedPipeline {
    segments: Vec<FusedSegment>,
    should_fail: bool,
}

impl MockCombinedPipeline {
    pub fn new() -> Self {
        Self {
            segments: vec![FusedSegment {
                start: 0.0,
                end: 4.0,
                speaker: "SPEAKER_00".to_string(),
                text: "combined output".to_string(),
                confidence: None,
                diarization_speaker: Some("SPEAKER_00".to_string()),
                identified_as: None,
                match_score: None,
            }],
            should_fail: false,
        }
    }

    pub fn with_segments(mut self, segments: Vec<FusedSegment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Default for MockCombinedPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::CombinedPipeline for MockCombinedPipeline {
    async fn diarize_and_transcribe(
        &self,
        _audio: &Path,
        _options: &CombinedOptions,
    ) -> Result<Vec<FusedSegment>> {
        if self.should_fail {
            return Err(ScrivanoError::Provider {
                provider: "combined".to_string(),
                status: 500,
                message: "mock combined failure".to_string(),
            });
        }
        Ok(self.segments.clone())
    }
}
