//! Thin stateless wrappers around the remote service families.
//!
//! Every call flows through the rate budget and the retry executor. The
//! traits are the seams the scheduler and the chunked transcriber consume;
//! mock implementations live here so tests never touch the network.

pub mod combined;
pub mod diarization;
pub mod transcription;

pub use combined::{CombinedClient, CombinedOptions};
pub use diarization::{DiarizationClient, IdentifyOptions};
pub use transcription::{TranscribeOptions, TranscriptionClient, TranscriptionModel};

use crate::convert;
use crate::error::{Result, ScrivanoError};
use crate::types::{
    DiarizationSegment, FusedSegment, JobHandle, JobKind, MediaHandle, TranscriptionSegment,
    Voiceprint,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Speaker segmentation service (diarize / identify).
#[async_trait]
pub trait Diarizer: Send + Sync {
    /// Runs diarization synchronously (submit + poll).
    async fn diarize(&self, media: &MediaHandle) -> Result<Vec<DiarizationSegment>>;

    /// Dispatches diarization with a webhook; completion arrives out of band.
    async fn diarize_async(&self, media: &MediaHandle, webhook_url: &str) -> Result<JobHandle>;

    /// Runs voiceprint identification synchronously.
    async fn identify(
        &self,
        media: &MediaHandle,
        voiceprints: &[Voiceprint],
        options: &IdentifyOptions,
    ) -> Result<Vec<DiarizationSegment>>;
}

/// Speech-to-text service for one local audio file (chunk-local time).
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>>;
}

/// Combined diarization+transcription service (absolute time).
#[async_trait]
pub trait CombinedPipeline: Send + Sync {
    async fn diarize_and_transcribe(
        &self,
        audio: &Path,
        options: &CombinedOptions,
    ) -> Result<Vec<FusedSegment>>;
}

/// Implement SpeechToText for Arc<T> to allow sharing across tasks.
#[async_trait]
impl<T: SpeechToText + ?Sized> SpeechToText for Arc<T> {
    async fn transcribe(
        &self,
        audio: &Path,
        options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>> {
        (**self).transcribe(audio, options).await
    }
}

/// Mock diarizer for tests.
pub struct MockDiarizer {
    segments: Vec<DiarizationSegment>,
    should_fail: bool,
    calls: AtomicU32,
}

impl MockDiarizer {
    pub fn new() -> Self {
        Self {
            segments: vec![DiarizationSegment::new(0.0, 5.0, "SPEAKER_00")],
            should_fail: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_segments(mut self, segments: Vec<DiarizationSegment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDiarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Diarizer for MockDiarizer {
    async fn diarize(&self, _media: &MediaHandle) -> Result<Vec<DiarizationSegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(ScrivanoError::Provider {
                provider: "diarization".to_string(),
                status: 500,
                message: "mock diarization failure".to_string(),
            });
        }
        Ok(self.segments.clone())
    }

    async fn diarize_async(&self, _media: &MediaHandle, webhook_url: &str) -> Result<JobHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JobHandle {
            job_id: format!("job-{}", uuid::Uuid::new_v4().simple()),
            kind: JobKind::Diarize,
            submitted_at: chrono::Utc::now(),
            webhook_url: Some(webhook_url.to_string()),
        })
    }

    async fn identify(
        &self,
        _media: &MediaHandle,
        voiceprints: &[Voiceprint],
        options: &IdentifyOptions,
    ) -> Result<Vec<DiarizationSegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(ScrivanoError::Provider {
                provider: "diarization".to_string(),
                status: 500,
                message: "mock identification failure".to_string(),
            });
        }
        // Label each configured segment round-robin with the given voiceprints
        let mut segments = self.segments.clone();
        for (i, segment) in segments.iter_mut().enumerate() {
            if let Some(vp) = voiceprints.get(i % voiceprints.len().max(1)) {
                segment.identified_as = Some(vp.label.clone());
                segment.match_score = Some(options.matching_threshold.max(0.9));
            }
        }
        Ok(segments)
    }
}

/// Mock speech-to-text for tests.
///
/// Either replays a fixed segment list, or synthesizes one whole-file
/// segment covering the probed WAV duration (the mid/high-tier shape).
pub struct MockSpeechToText {
    segments: Option<Vec<TranscriptionSegment>>,
    whole_file_text: Option<String>,
    delay: Option<Duration>,
    should_fail: bool,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl MockSpeechToText {
    pub fn new() -> Self {
        Self {
            segments: Some(vec![TranscriptionSegment::new(0.0, 1.0, "mock transcript")]),
            whole_file_text: None,
            delay: None,
            should_fail: false,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    pub fn with_segments(mut self, segments: Vec<TranscriptionSegment>) -> Self {
        self.segments = Some(segments);
        self.whole_file_text = None;
        self
    }

    /// Synthesize a single `[0, duration]` segment per call, like the
    /// mid/high model tiers.
    pub fn with_whole_file_text(mut self, text: impl Into<String>) -> Self {
        self.whole_file_text = Some(text.into());
        self.segments = None;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent transcribe calls observed.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockSpeechToText {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechToText for MockSpeechToText {
    async fn transcribe(
        &self,
        audio: &Path,
        _options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail {
            return Err(ScrivanoError::Provider {
                provider: "transcription".to_string(),
                status: 500,
                message: "mock transcription failure".to_string(),
            });
        }

        if let Some(text) = &self.whole_file_text {
            let duration = convert::wav_duration_seconds(audio)?;
            return Ok(vec![TranscriptionSegment::new(0.0, duration, text.clone())]);
        }

        Ok(self.segments.clone().unwrap_or_default())
    }
}
