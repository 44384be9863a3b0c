//! Default configuration constants for scrivano.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

use std::time::Duration;

/// Audio sample rate in Hz that all media is normalized to before upload.
///
/// 16kHz mono is the minimum rate accepted by both the speech and diarization
/// models and keeps upload volume small.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per second of normalized audio (16kHz, mono, 16-bit PCM).
pub const BYTES_PER_SECOND: u64 = SAMPLE_RATE as u64 * 2;

/// Minimum accepted input file size in bytes (1 KB).
///
/// Anything smaller cannot hold a media container header, let alone audio.
pub const MIN_INPUT_BYTES: u64 = 1024;

/// Maximum accepted input file size in bytes (300 MB).
pub const MAX_INPUT_BYTES: u64 = 300 * 1024 * 1024;

/// Maximum input duration accepted by the pipeline (24 hours).
pub const MAX_INPUT_SECONDS: f64 = 24.0 * 3600.0;

/// Largest file the transcription provider accepts in a single call (25 MB).
pub const MAX_SINGLE_CALL_BYTES: u64 = 25 * 1024 * 1024;

/// Target size for one transcription chunk (~20 MB, ~10 minutes of audio).
pub const TARGET_CHUNK_BYTES: u64 = 20 * 1024 * 1024;

/// Hard split boundary when no usable silence is found (15 minutes).
pub const HARD_SPLIT_SECONDS: f64 = 15.0 * 60.0;

/// Silence threshold relative to the file's mean loudness, in dB.
pub const SILENCE_THRESHOLD_DB: f64 = 16.0;

/// Minimum silence run considered a usable split point.
pub const MIN_SILENCE_MS: u64 = 2000;

/// Silence padding retained on each side of a cut.
pub const SILENCE_PADDING_MS: u64 = 500;

/// Maximum transcription chunks in flight at once.
pub const MAX_CONCURRENT_CHUNKS: usize = 3;

/// Per-chunk transcription timeout (30 minutes).
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// File extensions accepted as pipeline input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav", "mp4", "avi", "mov", "m4a", "flac"];

/// MIME types accepted as pipeline input.
///
/// Both the plain and `x-` spellings appear in the wild depending on
/// whether the type comes from content sniffing or an extension table.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/mp4",
    "audio/m4a",
    "audio/x-m4a",
    "audio/flac",
    "audio/x-flac",
    "video/mp4",
    "video/x-msvideo",
    "video/quicktime",
];

/// Rate budget window width.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Requests per window allowed against the diarization provider.
pub const DIARIZATION_RATE_LIMIT: usize = 20;

/// Requests per window allowed against the transcription provider.
pub const TRANSCRIPTION_RATE_LIMIT: usize = 50;

/// Requests per window allowed against the combined provider.
pub const COMBINED_RATE_LIMIT: usize = 100;

/// Base delay for quota (429) backoff.
pub const QUOTA_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap on a single quota backoff wait.
pub const QUOTA_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Maximum attempts when the provider keeps signalling quota exhaustion.
pub const QUOTA_MAX_ATTEMPTS: u32 = 8;

/// Maximum attempts for transient network failures.
pub const NETWORK_MAX_ATTEMPTS: u32 = 3;

/// Maximum attempts for other retryable provider errors.
pub const OTHER_MAX_ATTEMPTS: u32 = 3;

/// Fixed timeout for non-transcription provider calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Base of the adaptive transcription timeout: 60s plus 10s per MB.
pub const TRANSCRIPTION_TIMEOUT_BASE: Duration = Duration::from_secs(60);

/// Additional transcription timeout per megabyte of audio.
pub const TRANSCRIPTION_TIMEOUT_PER_MB: Duration = Duration::from_secs(10);

/// Cap on the adaptive transcription timeout.
pub const TRANSCRIPTION_TIMEOUT_CAP: Duration = Duration::from_secs(600);

/// Interval between diarization job status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum diarization job status polls before giving up (~3 minutes).
pub const POLL_MAX_ITERATIONS: u32 = 40;

/// Minimum single-speaker sample length accepted for a voiceprint.
pub const VOICEPRINT_MIN_SECONDS: f64 = 5.0;

/// Voiceprint sample length below which a quality warning is logged.
pub const VOICEPRINT_GOOD_SECONDS: f64 = 10.0;

/// Maximum single-speaker sample length accepted for a voiceprint.
pub const VOICEPRINT_MAX_SECONDS: f64 = 30.0;

/// Minimum share of a transcription segment that must overlap a diarization
/// segment for the speaker to be attributed. Below this the speaker is
/// labelled [`UNKNOWN_SPEAKER`].
pub const MIN_OVERLAP_RATIO: f64 = 0.1;

/// Speaker label used when no diarization segment overlaps enough.
pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";

/// Minimum diarization segment duration that must stay addressable when a
/// whole-file transcription is redistributed across speakers.
pub const MIN_ADDRESSABLE_SECONDS: f64 = 1.0;

/// Default matching threshold for voiceprint identification.
pub const IDENTIFY_MATCHING_THRESHOLD: f64 = 0.5;

/// Checkpoints older than this require an explicit resume request.
pub const AUTO_RESUME_MAX_AGE_HOURS: i64 = 24;

/// Pipeline states idle longer than this are purged by the retention task.
pub const RETENTION_HOURS: i64 = 48;

/// Default webhook server bind address.
pub const WEBHOOK_HOST: &str = "0.0.0.0";

/// Default webhook server port.
pub const WEBHOOK_PORT: u16 = 8000;

/// Default data root; interim artifacts and checkpoints live beneath it.
pub const DATA_ROOT: &str = "data";

/// Default transcription model (cheap tier, returns timed segments).
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
