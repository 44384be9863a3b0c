//! Diarization provider client (diarize / identify / voiceprint).
//!
//! The provider is job-based: submissions return a job id and the result is
//! fetched by polling `GET /jobs/{id}` or delivered to a webhook. Polling
//! counts against the rate budget like any other call.

use crate::budget::{ApiProvider, RateBudget};
use crate::convert;
use crate::defaults;
use crate::error::{Result, ScrivanoError};
use crate::retry::{self, RetryExecutor};
use crate::types::{
    self, DiarizationSegment, JobHandle, JobKind, JobStatus, MediaHandle, Voiceprint,
};
use crate::upload::MediaStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Options for a voiceprint identification call.
#[derive(Debug, Clone)]
pub struct IdentifyOptions {
    /// Similarity threshold below which a speaker stays unmatched.
    pub matching_threshold: f64,
    /// One voiceprint may claim at most one speaker.
    pub exclusive: bool,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            matching_threshold: defaults::IDENTIFY_MATCHING_THRESHOLD,
            exclusive: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobSubmitResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: JobStatus,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Extracts the segment list from a terminal job output.
///
/// Diarization jobs put it under `diarization`, identification jobs under
/// `identification`; a bare array is tolerated for forward compatibility.
pub(crate) fn parse_segments_output(output: &serde_json::Value) -> Result<Vec<DiarizationSegment>> {
    let list = output
        .get("diarization")
        .or_else(|| output.get("identification"))
        .unwrap_or(output);

    let segments: Vec<DiarizationSegment> =
        serde_json::from_value(list.clone()).map_err(|e| ScrivanoError::Schema {
            message: format!("diarization output: {e}"),
        })?;
    types::validate_diarization(&segments)?;
    Ok(segments)
}

/// Extracts the base64 voiceprint payload from a terminal job output.
pub(crate) fn parse_voiceprint_output(output: &serde_json::Value) -> Result<String> {
    output
        .get("voiceprint")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ScrivanoError::Schema {
            message: "voiceprint output missing 'voiceprint' field".to_string(),
        })
}

/// Client for the diarization provider's Jobs API.
pub struct DiarizationClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    budget: Arc<RateBudget>,
    retry: Arc<RetryExecutor>,
    poll_interval: Duration,
}

impl DiarizationClient {
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
            poll_interval: defaults::POLL_INTERVAL,
        }
    }

    /// Shortens the poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// POSTs a job submission and returns the provider job id.
    async fn submit(&self, endpoint: &str, body: serde_json::Value) -> Result<String> {
        let response: JobSubmitResponse = self
            .retry
            .run(ApiProvider::Diarization, endpoint, || {
                let body = body.clone();
                async move {
                    let _ticket = self.budget.acquire(ApiProvider::Diarization).await;
                    let response = self
                        .http
                        .post(format!("{}/{endpoint}", self.base_url))
                        .bearer_auth(&self.token)
                        .timeout(retry::default_call_timeout())
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| ScrivanoError::from_transport("diarization", e))?;

                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(ScrivanoError::from_status(
                            "diarization",
                            status.as_u16(),
                            text,
                        ));
                    }
                    response
                        .json::<JobSubmitResponse>()
                        .await
                        .map_err(|e| ScrivanoError::Schema {
                            message: format!("job submission response: {e}"),
                        })
                }
            })
            .await?;

        tracing::info!(job_id = %response.job_id, endpoint, "job submitted");
        Ok(response.job_id)
    }

    /// Fetches the status of one job (single request, budget-counted).
    async fn fetch_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        self.retry
            .run(ApiProvider::Diarization, "job_status", || async {
                let _ticket = self.budget.acquire(ApiProvider::Diarization).await;
                let response = self
                    .http
                    .get(format!("{}/jobs/{job_id}", self.base_url))
                    .bearer_auth(&self.token)
                    .timeout(retry::default_call_timeout())
                    .send()
                    .await
                    .map_err(|e| ScrivanoError::from_transport("diarization", e))?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ScrivanoError::from_status(
                        "diarization",
                        status.as_u16(),
                        text,
                    ));
                }
                response
                    .json::<JobStatusResponse>()
                    .await
                    .map_err(|e| ScrivanoError::Schema {
                        message: format!("job status response: {e}"),
                    })
            })
            .await
    }

    /// Polls a job until it reaches a terminal state.
    ///
    /// Gives up after [`defaults::POLL_MAX_ITERATIONS`] rounds (~3 minutes
    /// at the default interval).
    async fn poll_until_done(&self, job_id: &str) -> Result<serde_json::Value> {
        for iteration in 0..defaults::POLL_MAX_ITERATIONS {
            let status = self.fetch_status(job_id).await?;
            match status.status {
                JobStatus::Succeeded => {
                    tracing::info!(job_id, iteration, "job succeeded");
                    return status.output.ok_or_else(|| ScrivanoError::Schema {
                        message: format!("job {job_id} succeeded without output"),
                    });
                }
                JobStatus::Failed | JobStatus::Canceled => {
                    return Err(ScrivanoError::Provider {
                        provider: "diarization".to_string(),
                        status: 0,
                        message: format!(
                            "job {job_id} ended as {:?}: {}",
                            status.status,
                            status.error.unwrap_or_default()
                        ),
                    });
                }
                JobStatus::Created | JobStatus::Running => {
                    tracing::debug!(job_id, iteration, "job still running");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        Err(ScrivanoError::Provider {
            provider: "diarization".to_string(),
            status: 0,
            message: format!(
                "job {job_id} not finished after {} polls",
                defaults::POLL_MAX_ITERATIONS
            ),
        })
    }

    /// Creates a voiceprint from a short single-speaker sample.
    ///
    /// The sample must be 5-30s long; 10-30s gives the best match quality.
    pub async fn create_voiceprint(
        &self,
        uploader: &dyn MediaStore,
        sample: &Path,
        label: &str,
    ) -> Result<Voiceprint> {
        let duration = convert::wav_duration_seconds(sample)?;
        let good_quality = types::validate_voiceprint_duration(duration)?;
        if !good_quality {
            tracing::warn!(
                label,
                duration_seconds = duration,
                "voiceprint sample is short; 10-30s gives better matches"
            );
        }

        let media = uploader.upload(sample).await?;
        let job_id = self
            .submit("voiceprint", json!({ "url": media.as_str() }))
            .await?;
        let output = self.poll_until_done(&job_id).await?;
        let payload = parse_voiceprint_output(&output)?;

        Ok(Voiceprint {
            id: job_id,
            label: label.to_string(),
            payload,
            created_at: chrono::Utc::now(),
            duration_seconds: duration,
        })
    }
}

#[async_trait]
impl super::Diarizer for DiarizationClient {
    async fn diarize(&self, media: &MediaHandle) -> Result<Vec<DiarizationSegment>> {
        let job_id = self
            .submit("diarize", json!({ "url": media.as_str() }))
            .await?;
        let output = self.poll_until_done(&job_id).await?;
        let segments = parse_segments_output(&output)?;
        tracing::info!(segments = segments.len(), "diarization finished");
        Ok(segments)
    }

    async fn diarize_async(&self, media: &MediaHandle, webhook_url: &str) -> Result<JobHandle> {
        let job_id = self
            .submit(
                "diarize",
                json!({ "url": media.as_str(), "webhook": webhook_url }),
            )
            .await?;
        Ok(JobHandle {
            job_id,
            kind: JobKind::Diarize,
            submitted_at: chrono::Utc::now(),
            webhook_url: Some(webhook_url.to_string()),
        })
    }

    async fn identify(
        &self,
        media: &MediaHandle,
        voiceprints: &[Voiceprint],
        options: &IdentifyOptions,
    ) -> Result<Vec<DiarizationSegment>> {
        if voiceprints.is_empty() {
            return Err(ScrivanoError::Validation {
                message: "identification needs at least one voiceprint".to_string(),
            });
        }

        let prints: Vec<_> = voiceprints
            .iter()
            .map(|vp| json!({ "label": vp.label, "voiceprint": vp.payload }))
            .collect();

        let job_id = self
            .submit(
                "identify",
                json!({
                    "url": media.as_str(),
                    "voiceprints": prints,
                    "matching_threshold": options.matching_threshold,
                    "exclusive": options.exclusive,
                }),
            )
            .await?;
        let output = self.poll_until_done(&job_id).await?;
        let segments = parse_segments_output(&output)?;
        tracing::info!(
            segments = segments.len(),
            voiceprints = voiceprints.len(),
            "identification finished"
        );
        Ok(segments)
    }
}
