//! Chunked parallel transcription.
//!
//! Oversized recordings are split on silence, transcribed concurrently
//! under a bounded worker pool, and stitched back onto the original
//! timeline. Chunk files are temporary and removed on every exit path.

pub mod silence;
pub mod splitter;

pub use silence::{SilenceConfig, SilenceRegion, detect_silence};
pub use splitter::{Chunk, SplitConfig, plan_cut_points, split_wav, validate_chunks};

use crate::convert;
use crate::defaults;
use crate::error::{Result, ScrivanoError};
use crate::providers::{SpeechToText, TranscribeOptions};
use crate::types::{self, TranscriptionSegment};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Tuning for the chunked transcriber.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub split: SplitConfig,
    /// Chunks in flight at once.
    pub max_concurrent: usize,
    /// Wall-clock limit per chunk, retries included.
    pub chunk_timeout: Duration,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            split: SplitConfig::default(),
            max_concurrent: defaults::MAX_CONCURRENT_CHUNKS,
            chunk_timeout: defaults::CHUNK_TIMEOUT,
        }
    }
}

/// Removes the chunk directory on every exit path.
struct ChunkDirGuard(PathBuf);

impl Drop for ChunkDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.0.display(), error = %e, "failed to remove chunk dir");
            }
        }
    }
}

/// Transcribes a normalized WAV of any size into absolute file time.
pub struct ChunkedTranscriber {
    stt: Arc<dyn SpeechToText>,
    config: ChunkingConfig,
}

impl ChunkedTranscriber {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self::with_config(stt, ChunkingConfig::default())
    }

    pub fn with_config(stt: Arc<dyn SpeechToText>, config: ChunkingConfig) -> Self {
        Self { stt, config }
    }

    /// Transcribes `wav`, splitting if it exceeds the single-call limit.
    ///
    /// `workdir` hosts the temporary chunk directory; `cancel` aborts all
    /// in-flight chunks cooperatively.
    pub async fn transcribe(
        &self,
        wav: &Path,
        options: &TranscribeOptions,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptionSegment>> {
        let size = tokio::fs::metadata(wav).await?.len();

        if size <= self.config.split.max_single_call_bytes {
            tracing::debug!(file = %wav.display(), size, "file fits a single call");
            return self.stt.transcribe(wav, options).await;
        }

        convert::ensure_normalized_wav(wav)?;
        let total_seconds = convert::wav_duration_seconds(wav)?;
        let regions = detect_silence(wav, &self.config.split.silence)?;
        let cuts = plan_cut_points(total_seconds, &regions, &self.config.split);

        let chunk_dir = workdir.join(format!(
            "chunks_{}",
            uuid::Uuid::new_v4().simple()
        ));
        let _guard = ChunkDirGuard(chunk_dir.clone());

        let chunks = split_wav(wav, &cuts, &chunk_dir)?;
        validate_chunks(&chunks)?;
        tracing::info!(
            file = %wav.display(),
            chunks = chunks.len(),
            total_seconds,
            "transcribing in parallel chunks"
        );

        let stitched = self.run_chunks(chunks, options, cancel).await?;
        types::validate_transcription(&stitched).map_err(|e| ScrivanoError::Internal {
            message: format!("stitched segments violate ordering: {e}"),
        })?;
        Ok(stitched)
    }

    async fn run_chunks(
        &self,
        chunks: Vec<Chunk>,
        options: &TranscribeOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptionSegment>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let chunk_cancel = cancel.child_token();
        let mut tasks: JoinSet<Result<(usize, f64, Vec<TranscriptionSegment>)>> = JoinSet::new();

        for chunk in chunks {
            let semaphore = semaphore.clone();
            let stt = self.stt.clone();
            let options = options.clone();
            let token = chunk_cancel.clone();
            let timeout = self.config.chunk_timeout;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ScrivanoError::Cancelled)?;

                tokio::select! {
                    _ = token.cancelled() => Err(ScrivanoError::Cancelled),
                    result = tokio::time::timeout(timeout, stt.transcribe(&chunk.path, &options)) => {
                        match result {
                            Ok(Ok(segments)) => Ok((chunk.index, chunk.offset_seconds, segments)),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(ScrivanoError::Provider {
                                provider: "transcription".to_string(),
                                status: 0,
                                message: format!(
                                    "chunk {} timed out after {}s",
                                    chunk.index,
                                    timeout.as_secs()
                                ),
                            }),
                        }
                    }
                }
            });
        }

        let mut results = Vec::new();
        let mut failure: Option<ScrivanoError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    // First failure wins; drain the rest after cancelling
                    chunk_cancel.cancel();
                    failure.get_or_insert(e);
                }
                Err(join_error) => {
                    chunk_cancel.cancel();
                    failure.get_or_insert(ScrivanoError::Internal {
                        message: format!("chunk task panicked: {join_error}"),
                    });
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        // Chunks finish out of order; re-sort by index before stitching
        results.sort_by_key(|(index, _, _)| *index);

        let mut stitched = Vec::new();
        for (_, offset, segments) in results {
            for mut segment in segments {
                segment.start += offset;
                segment.end += offset;
                stitched.push(segment);
            }
        }
        Ok(stitched)
    }
}
