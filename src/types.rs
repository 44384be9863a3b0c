//! Typed records that flow between pipeline stages.
//!
//! Every payload crossing a persistence boundary is one of these structs and
//! is validated on read; raw provider JSON never travels further than the
//! provider clients.

use crate::defaults;
use crate::error::{Result, ScrivanoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to media stored with the diarization provider.
///
/// Produced once per run by the uploader; the remote copy expires on its own
/// after 24-48 hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaHandle(pub String);

impl MediaHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One speaker turn reported by the diarization provider.
///
/// Segments may overlap when the provider detects cross-talk; consumers must
/// tolerate overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Voiceprint label, present only on identification output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identified_as: Option<String>,
    /// Voiceprint match score, present only on identification output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

impl DiarizationSegment {
    pub fn new(start: f64, end: f64, speaker: impl Into<String>) -> Self {
        Self {
            start,
            end,
            speaker: speaker.into(),
            confidence: None,
            identified_as: None,
            match_score: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// One timed utterance reported by the transcription provider.
///
/// Whitespace and casing are preserved exactly as returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptionSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            confidence: None,
            language: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Canonical pipeline output: one speaker-attributed utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Raw diarization label before any voiceprint mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diarization_speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identified_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

/// A stored voiceprint consumed read-only by identification calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voiceprint {
    pub id: String,
    pub label: String,
    /// Opaque provider payload, base64 as delivered.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Kind of asynchronous provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Diarize,
    Identify,
    Voiceprint,
}

impl JobKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Diarize => "diarize",
            Self::Identify => "identify",
            Self::Voiceprint => "voiceprint",
        }
    }
}

/// Terminal and non-terminal states of a provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Succeeded,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Failed)
    }
}

/// Handle for a provider job dispatched with a webhook instead of polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// A provider callback delivered to the webhook endpoint.
///
/// Failed and canceled events are valid payloads and are recorded like any
/// other; redeliveries carry `retry_num`/`retry_reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(alias = "jobId")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
}

/// Checks a diarization list for schema-level sanity.
///
/// Segments must be non-empty, have positive duration and non-decreasing
/// starts. Overlap between segments is allowed.
pub fn validate_diarization(segments: &[DiarizationSegment]) -> Result<()> {
    if segments.is_empty() {
        return Err(ScrivanoError::Schema {
            message: "diarization output is empty".to_string(),
        });
    }
    validate_ordering(segments.iter().map(|s| (s.start, s.end)), "diarization")
}

/// Checks a transcription list for schema-level sanity.
pub fn validate_transcription(segments: &[TranscriptionSegment]) -> Result<()> {
    validate_ordering(segments.iter().map(|s| (s.start, s.end)), "transcription")
}

/// Checks the fused output invariants: `start < end` per segment and
/// non-decreasing starts across the list.
pub fn validate_fused(segments: &[FusedSegment]) -> Result<()> {
    validate_ordering(segments.iter().map(|s| (s.start, s.end)), "fused")
}

fn validate_ordering(
    bounds: impl Iterator<Item = (f64, f64)>,
    what: &str,
) -> Result<()> {
    let mut prev_start = f64::NEG_INFINITY;
    for (i, (start, end)) in bounds.enumerate() {
        if start < 0.0 || !start.is_finite() || !end.is_finite() {
            return Err(ScrivanoError::Schema {
                message: format!("{what} segment {i} has non-finite or negative bounds"),
            });
        }
        if start >= end {
            return Err(ScrivanoError::Schema {
                message: format!("{what} segment {i} has start {start} >= end {end}"),
            });
        }
        if start < prev_start {
            return Err(ScrivanoError::Schema {
                message: format!("{what} segment {i} starts before its predecessor"),
            });
        }
        prev_start = start;
    }
    Ok(())
}

/// Checks a voiceprint sample duration against the accepted range.
///
/// Returns `Ok(true)` when the sample is long enough for good quality,
/// `Ok(false)` when it is accepted but short (5-10s: callers should warn).
pub fn validate_voiceprint_duration(seconds: f64) -> Result<bool> {
    if seconds < defaults::VOICEPRINT_MIN_SECONDS {
        return Err(ScrivanoError::Validation {
            message: format!(
                "voiceprint sample is {seconds:.1}s; at least {:.0}s required",
                defaults::VOICEPRINT_MIN_SECONDS
            ),
        });
    }
    if seconds > defaults::VOICEPRINT_MAX_SECONDS {
        return Err(ScrivanoError::Validation {
            message: format!(
                "voiceprint sample is {seconds:.1}s; at most {:.0}s accepted",
                defaults::VOICEPRINT_MAX_SECONDS
            ),
        });
    }
    Ok(seconds >= defaults::VOICEPRINT_GOOD_SECONDS)
}
