//! Silence scanning over normalized WAV files.
//!
//! Finds quiet stretches long enough to cut a recording at without clipping
//! words. The threshold adapts to the file: a region is silent when its
//! level drops a fixed number of dB below the file's mean loudness.

use crate::defaults;
use crate::error::{Result, ScrivanoError};
use std::path::Path;

/// Tuning for the silence scanner.
#[derive(Debug, Clone)]
pub struct SilenceConfig {
    /// dB below the file's mean loudness at which a frame counts as silent.
    pub threshold_offset_db: f64,
    /// Minimum silent run to qualify as a cut candidate, in milliseconds.
    pub min_silence_ms: u64,
    /// Silence kept on each side of a cut, in milliseconds.
    pub padding_ms: u64,
    /// Analysis frame length in milliseconds.
    pub frame_ms: u64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold_offset_db: defaults::SILENCE_THRESHOLD_DB,
            min_silence_ms: defaults::MIN_SILENCE_MS,
            padding_ms: defaults::SILENCE_PADDING_MS,
            frame_ms: 100,
        }
    }
}

/// One detected silent stretch, in seconds from the start of the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceRegion {
    pub start: f64,
    pub end: f64,
}

impl SilenceRegion {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }

    /// Interval inside the region where a cut keeps the configured padding
    /// of silence on both sides.
    pub fn cut_window(&self, config: &SilenceConfig) -> (f64, f64) {
        let pad = config.padding_ms as f64 / 1000.0;
        (self.start + pad, self.end - pad)
    }
}

fn frame_dbfs(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return f64::NEG_INFINITY;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    if rms <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * rms.log10()
    }
}

/// Scans a normalized WAV for silence regions.
///
/// Frames quieter than `mean_dbfs - threshold_offset_db` are silent; runs of
/// at least `min_silence_ms` become regions. Returns regions in time order.
pub fn detect_silence(path: &Path, config: &SilenceConfig) -> Result<Vec<SilenceRegion>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| ScrivanoError::Validation {
        message: format!("cannot open {}: {e}", path.display()),
    })?;
    let spec = reader.spec();
    let frame_len = (spec.sample_rate as u64 * config.frame_ms / 1000) as usize;
    if frame_len == 0 {
        return Err(ScrivanoError::Internal {
            message: "silence frame length is zero".to_string(),
        });
    }

    // One pass: per-frame loudness plus the running total for the mean
    let mut frames = Vec::new();
    let mut buffer = Vec::with_capacity(frame_len);
    let mut sum_squares = 0.0f64;
    let mut total_samples = 0u64;

    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|e| ScrivanoError::Validation {
            message: format!("corrupt WAV data in {}: {e}", path.display()),
        })?;
        let normalized = sample as f64 / i16::MAX as f64;
        sum_squares += normalized * normalized;
        total_samples += 1;

        buffer.push(sample);
        if buffer.len() == frame_len {
            frames.push(frame_dbfs(&buffer));
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        frames.push(frame_dbfs(&buffer));
    }

    if total_samples == 0 {
        return Ok(Vec::new());
    }

    let mean_rms = (sum_squares / total_samples as f64).sqrt();
    let mean_dbfs = if mean_rms <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * mean_rms.log10()
    };
    let threshold = mean_dbfs - config.threshold_offset_db;

    let frame_seconds = config.frame_ms as f64 / 1000.0;
    let min_frames = (config.min_silence_ms / config.frame_ms).max(1) as usize;

    let mut regions = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &dbfs) in frames.iter().enumerate() {
        if dbfs < threshold {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take()
            && i - start >= min_frames
        {
            regions.push(SilenceRegion {
                start: start as f64 * frame_seconds,
                end: i as f64 * frame_seconds,
            });
        }
    }
    if let Some(start) = run_start
        && frames.len() - start >= min_frames
    {
        regions.push(SilenceRegion {
            start: start as f64 * frame_seconds,
            end: frames.len() as f64 * frame_seconds,
        });
    }

    tracing::debug!(
        file = %path.display(),
        regions = regions.len(),
        mean_dbfs,
        threshold,
        "silence scan finished"
    );
    Ok(regions)
}
