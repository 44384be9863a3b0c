//! Chunk planning and extraction for oversized recordings.
//!
//! Cut points prefer silence midpoints near the target chunk size; when no
//! usable silence exists inside the search window the recording is split
//! hard at the window boundary. Chunks are written as normalized WAV files
//! whose offsets reconstruct the original timeline exactly.

use crate::defaults;
use crate::error::{Result, ScrivanoError};
use crate::transcribe::silence::{SilenceConfig, SilenceRegion};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

/// One extracted chunk awaiting transcription.
///
/// Indices are contiguous and ordered; `offset_seconds` of chunk `i+1`
/// equals `offset_i + duration_i` because cuts never drop samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub offset_seconds: f64,
    pub path: PathBuf,
    pub duration_seconds: f64,
}

/// Sizing knobs for the splitter.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Files at or below this size are transcribed in one call.
    pub max_single_call_bytes: u64,
    /// Preferred chunk size; cuts aim for the silence nearest this.
    pub target_chunk_bytes: u64,
    /// Hard split boundary when no usable silence is found.
    pub hard_split_seconds: f64,
    pub silence: SilenceConfig,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_single_call_bytes: defaults::MAX_SINGLE_CALL_BYTES,
            target_chunk_bytes: defaults::TARGET_CHUNK_BYTES,
            hard_split_seconds: defaults::HARD_SPLIT_SECONDS,
            silence: SilenceConfig::default(),
        }
    }
}

impl SplitConfig {
    fn target_seconds(&self) -> f64 {
        self.target_chunk_bytes as f64 / defaults::BYTES_PER_SECOND as f64
    }

    /// Longest chunk we may emit. The hard-split window is capped by the
    /// provider's single-call size limit; a 15-minute hard chunk would be
    /// rejected upstream otherwise.
    fn max_chunk_seconds(&self) -> f64 {
        let single_call_seconds =
            self.max_single_call_bytes as f64 / defaults::BYTES_PER_SECOND as f64;
        self.hard_split_seconds.min(single_call_seconds)
    }
}

/// Chooses cut points for a recording of `total_seconds`.
///
/// Returns cut positions in seconds, exclusive of 0 and the end.
pub fn plan_cut_points(
    total_seconds: f64,
    regions: &[SilenceRegion],
    config: &SplitConfig,
) -> Vec<f64> {
    let target = config.target_seconds();
    let max_chunk = config.max_chunk_seconds();

    let mut cuts = Vec::new();
    let mut chunk_start = 0.0f64;

    while total_seconds - chunk_start > max_chunk {
        let ideal = chunk_start + target;
        let limit = chunk_start + max_chunk;
        // Cuts closer than half the target would produce confetti chunks
        let floor = chunk_start + target / 2.0;

        // Best silence cut: inside the window, closest to the ideal point
        let cut = regions
            .iter()
            .filter(|r| r.duration() * 1000.0 >= config.silence.min_silence_ms as f64)
            .filter_map(|r| {
                let (low, high) = r.cut_window(&config.silence);
                if low >= high {
                    return None;
                }
                let candidate = ideal.clamp(low, high);
                (candidate > floor && candidate <= limit).then_some(candidate)
            })
            .min_by(|a, b| {
                (a - ideal)
                    .abs()
                    .partial_cmp(&(b - ideal).abs())
                    .expect("cut candidates are finite")
            });

        let cut = match cut {
            Some(cut) => cut,
            None => {
                tracing::warn!(
                    chunk_start,
                    limit,
                    "no usable silence in window; splitting hard"
                );
                limit
            }
        };

        cuts.push(cut);
        chunk_start = cut;
    }

    cuts
}

/// Extracts chunks from `wav` at the given cut points into `dir`.
///
/// Streams the file once; every sample lands in exactly one chunk.
pub fn split_wav(wav: &Path, cuts: &[f64], dir: &Path) -> Result<Vec<Chunk>> {
    let mut reader = hound::WavReader::open(wav).map_err(|e| ScrivanoError::Validation {
        message: format!("cannot open {}: {e}", wav.display()),
    })?;
    let spec = reader.spec();
    let sample_rate = spec.sample_rate as f64;
    let total_samples = reader.duration() as u64;

    std::fs::create_dir_all(dir)?;

    // Cut positions in samples, terminated by the end of the file
    let mut boundaries: Vec<u64> = cuts
        .iter()
        .map(|&c| (c * sample_rate).round() as u64)
        .collect();
    boundaries.push(total_samples);

    let writer_spec = WavSpec {
        channels: 1,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut chunks = Vec::new();
    let mut chunk_start: u64 = 0;
    let mut samples = reader.samples::<i16>();

    for (index, &boundary) in boundaries.iter().enumerate() {
        if boundary <= chunk_start {
            return Err(ScrivanoError::Internal {
                message: format!("non-monotonic cut at chunk {index}"),
            });
        }

        let path = dir.join(format!("chunk_{index:03}.wav"));
        let mut writer =
            WavWriter::create(&path, writer_spec).map_err(|e| ScrivanoError::Internal {
                message: format!("cannot create chunk file: {e}"),
            })?;

        for _ in chunk_start..boundary {
            let sample = samples
                .next()
                .transpose()
                .map_err(|e| ScrivanoError::Validation {
                    message: format!("corrupt WAV data in {}: {e}", wav.display()),
                })?
                .ok_or_else(|| ScrivanoError::Internal {
                    message: "WAV ended before planned boundary".to_string(),
                })?;
            writer.write_sample(sample).map_err(|e| ScrivanoError::Internal {
                message: format!("cannot write chunk sample: {e}"),
            })?;
        }
        writer.finalize().map_err(|e| ScrivanoError::Internal {
            message: format!("cannot finalize chunk file: {e}"),
        })?;

        chunks.push(Chunk {
            index,
            offset_seconds: chunk_start as f64 / sample_rate,
            path,
            duration_seconds: (boundary - chunk_start) as f64 / sample_rate,
        });
        chunk_start = boundary;
    }

    tracing::info!(chunks = chunks.len(), file = %wav.display(), "split into chunks");
    Ok(chunks)
}

/// Checks the chunk list invariants: contiguous indices and offsets that
/// chain within the allowed slack.
pub fn validate_chunks(chunks: &[Chunk]) -> Result<()> {
    const MAX_SLACK_SECONDS: f64 = 2.0;

    let mut expected_offset = 0.0f64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i {
            return Err(ScrivanoError::Internal {
                message: format!("chunk index {} at position {i}", chunk.index),
            });
        }
        if (chunk.offset_seconds - expected_offset).abs() > MAX_SLACK_SECONDS {
            return Err(ScrivanoError::Internal {
                message: format!(
                    "chunk {i} offset {:.2}s drifts from expected {:.2}s",
                    chunk.offset_seconds, expected_offset
                ),
            });
        }
        expected_offset = chunk.offset_seconds + chunk.duration_seconds;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::test_support::{tone, write_test_wav};
    use tempfile::tempdir;

    fn test_config() -> SplitConfig {
        // Scaled down: ~2s chunks against a ~1.25s target
        SplitConfig {
            max_single_call_bytes: 2 * defaults::BYTES_PER_SECOND,
            target_chunk_bytes: defaults::BYTES_PER_SECOND + defaults::BYTES_PER_SECOND / 4,
            hard_split_seconds: 2.0,
            silence: SilenceConfig {
                min_silence_ms: 300,
                padding_ms: 50,
                ..SilenceConfig::default()
            },
        }
    }

    #[test]
    fn test_no_cuts_for_short_file() {
        let cuts = plan_cut_points(1.5, &[], &test_config());
        assert!(cuts.is_empty());
    }

    #[test]
    fn test_cut_lands_in_silence_near_target() {
        let regions = vec![SilenceRegion { start: 1.2, end: 1.7 }];
        let cuts = plan_cut_points(3.0, &regions, &test_config());

        assert_eq!(cuts.len(), 1);
        // Ideal is 1.25; the cut must stay inside the padded window
        assert!(cuts[0] >= 1.25 && cuts[0] <= 1.65, "cut={}", cuts[0]);
    }

    #[test]
    fn test_hard_split_without_silence() {
        let cuts = plan_cut_points(5.0, &[], &test_config());
        assert!(!cuts.is_empty());
        assert!((cuts[0] - 2.0).abs() < 0.01, "cut={}", cuts[0]);
    }

    #[test]
    fn test_silence_outside_window_forces_hard_split() {
        // Silence exists but only after the hard boundary
        let regions = vec![SilenceRegion { start: 2.5, end: 3.0 }];
        let cuts = plan_cut_points(4.5, &regions, &test_config());
        assert!((cuts[0] - 2.0).abs() < 0.01, "cut={}", cuts[0]);
    }

    #[test]
    fn test_hard_split_caps_at_single_call_size() {
        let config = SplitConfig {
            max_single_call_bytes: defaults::BYTES_PER_SECOND, // 1s
            target_chunk_bytes: defaults::BYTES_PER_SECOND / 2,
            hard_split_seconds: 10.0,
            silence: SilenceConfig::default(),
        };
        let cuts = plan_cut_points(3.5, &[], &config);
        // Every chunk must be at most 1s despite the 10s hard window
        let mut prev = 0.0;
        for &cut in &cuts {
            assert!(cut - prev <= 1.01, "chunk of {}s", cut - prev);
            prev = cut;
        }
    }

    #[test]
    fn test_split_wav_roundtrip_offsets() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("four_seconds.wav");
        write_test_wav(&wav, &tone(4.0, 6000));

        let chunks = split_wav(&wav, &[1.5, 3.0], dir.path().join("chunks").as_path()).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].offset_seconds, 0.0);
        assert!((chunks[0].duration_seconds - 1.5).abs() < 0.001);
        assert!((chunks[1].offset_seconds - 1.5).abs() < 0.001);
        assert!((chunks[2].offset_seconds - 3.0).abs() < 0.001);
        assert!((chunks[2].duration_seconds - 1.0).abs() < 0.001);

        for chunk in &chunks {
            assert!(chunk.path.exists());
        }
        validate_chunks(&chunks).unwrap();
    }

    #[test]
    fn test_split_wav_preserves_every_sample() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("source.wav");
        let samples = tone(2.0, 5000);
        write_test_wav(&wav, &samples);

        let chunks = split_wav(&wav, &[0.75], dir.path().join("chunks").as_path()).unwrap();

        let total: u32 = chunks
            .iter()
            .map(|c| hound::WavReader::open(&c.path).unwrap().duration())
            .sum();
        assert_eq!(total as usize, samples.len());
    }

    #[test]
    fn test_validate_chunks_rejects_gap() {
        let chunks = vec![
            Chunk {
                index: 0,
                offset_seconds: 0.0,
                path: PathBuf::from("a.wav"),
                duration_seconds: 10.0,
            },
            Chunk {
                index: 1,
                offset_seconds: 15.0, // 5s hole
                path: PathBuf::from("b.wav"),
                duration_seconds: 10.0,
            },
        ];
        assert!(validate_chunks(&chunks).is_err());
    }

    #[test]
    fn test_validate_chunks_rejects_bad_index() {
        let chunks = vec![Chunk {
            index: 3,
            offset_seconds: 0.0,
            path: PathBuf::from("a.wav"),
            duration_seconds: 10.0,
        }];
        assert!(validate_chunks(&chunks).is_err());
    }
}
