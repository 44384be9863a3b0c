//! Audio normalization seam.
//!
//! The pipeline never does acoustic processing itself; it hands any input
//! container to an external converter and expects 16kHz mono 16-bit PCM WAV
//! back. The ffmpeg implementation mirrors what the rest of the toolchain
//! assumes about normalized audio.

use crate::defaults;
use crate::error::{Result, ScrivanoError};
use async_trait::async_trait;
use std::path::Path;

/// Converts arbitrary audio/video input into normalized WAV.
#[async_trait]
pub trait AudioConverter: Send + Sync {
    /// Writes a 16kHz mono 16-bit PCM WAV rendition of `src` to `dest`.
    async fn convert_to_wav(&self, src: &Path, dest: &Path) -> Result<()>;
}

/// Shells out to ffmpeg for the actual conversion.
pub struct FfmpegConverter {
    binary: String,
}

impl FfmpegConverter {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }

    /// Uses a non-default ffmpeg binary (e.g. a pinned build).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioConverter for FfmpegConverter {
    async fn convert_to_wav(&self, src: &Path, dest: &Path) -> Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(src)
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(defaults::SAMPLE_RATE.to_string())
            .arg("-sample_fmt")
            .arg("s16")
            .arg("-vn")
            .arg(dest)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScrivanoError::Validation {
                message: format!(
                    "ffmpeg failed to convert {}: {}",
                    src.display(),
                    stderr.lines().last().unwrap_or("unknown error")
                ),
            });
        }

        tracing::debug!(src = %src.display(), dest = %dest.display(), "converted to 16kHz mono WAV");
        Ok(())
    }
}

/// Test converter that copies the source file verbatim.
///
/// Tests feed it already-normalized WAV fixtures.
pub struct MockConverter {
    should_fail: bool,
}

impl MockConverter {
    pub fn new() -> Self {
        Self { should_fail: false }
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Default for MockConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioConverter for MockConverter {
    async fn convert_to_wav(&self, src: &Path, dest: &Path) -> Result<()> {
        if self.should_fail {
            return Err(ScrivanoError::Validation {
                message: "mock conversion failure".to_string(),
            });
        }
        tokio::fs::copy(src, dest).await?;
        Ok(())
    }
}

/// Reads the duration of a WAV file from its header.
pub fn wav_duration_seconds(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path).map_err(|e| ScrivanoError::Validation {
        message: format!("cannot read WAV header of {}: {e}", path.display()),
    })?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Checks that a WAV file matches the normalized format the providers and
/// the silence scanner expect.
pub fn ensure_normalized_wav(path: &Path) -> Result<()> {
    let reader = hound::WavReader::open(path).map_err(|e| ScrivanoError::Validation {
        message: format!("cannot read WAV header of {}: {e}", path.display()),
    })?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.sample_rate != defaults::SAMPLE_RATE
        || spec.bits_per_sample != 16
    {
        return Err(ScrivanoError::Validation {
            message: format!(
                "{} is {}ch {}Hz {}bit; expected mono {}Hz 16bit",
                path.display(),
                spec.channels,
                spec.sample_rate,
                spec.bits_per_sample,
                defaults::SAMPLE_RATE
            ),
        });
    }
    Ok(())
}
