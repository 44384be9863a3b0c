//! Stage scheduler: drives the pipeline as an ordered DAG with
//! checkpoint-based resumption.
//!
//! Completed stages whose stored outputs validate are skipped; everything
//! else executes, checkpoints after success, and persists state atomically.
//! Diarization and transcription run concurrently in the standard pipeline.
//! A stage dispatched with a webhook URL parks as a pending job; the
//! webhook endpoint completes it out of band and the next invocation
//! carries on from there.

use crate::checkpoint::{
    CheckpointStore, PipelineKind, PipelineState, Stage, StateValidity,
};
use crate::config::Config;
use crate::convert::AudioConverter;
use crate::error::{Result, ScrivanoError};
use crate::export::Exporter;
use crate::fuse::{SegmentFuser, identification_to_fused};
use crate::providers::diarization::parse_segments_output;
use crate::providers::{
    CombinedOptions, CombinedPipeline, Diarizer, IdentifyOptions, SpeechToText,
    TranscribeOptions,
};
use crate::retry::RetryExecutor;
use crate::transcribe::{ChunkedTranscriber, ChunkingConfig};
use crate::types::{
    self, DiarizationSegment, FusedSegment, JobHandle, JobStatus, MediaHandle,
    TranscriptionSegment, Voiceprint, WebhookEvent,
};
use crate::budget::RateBudget;
use crate::upload::{self, MediaStore};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Process-wide dependencies threaded through every run.
pub struct Runtime {
    pub config: Config,
    pub budget: Arc<RateBudget>,
    pub retry: Arc<RetryExecutor>,
    pub cancel: CancellationToken,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let cancel = CancellationToken::new();
        Self {
            budget: Arc::new(RateBudget::new(&config.limits)),
            retry: Arc::new(RetryExecutor::new(cancel.clone())),
            cancel,
            config,
        }
    }
}

/// External collaborators the scheduler drives.
pub struct Collaborators {
    pub converter: Arc<dyn AudioConverter>,
    pub media_store: Arc<dyn MediaStore>,
    pub diarizer: Arc<dyn Diarizer>,
    pub speech_to_text: Arc<dyn SpeechToText>,
    pub combined: Arc<dyn CombinedPipeline>,
    pub exporter: Arc<dyn Exporter>,
}

/// One pipeline invocation.
#[derive(Clone)]
pub struct PipelineRequest {
    pub input: PathBuf,
    pub kind: PipelineKind,
    /// Export destination; defaults to `processed/{stem}.json`.
    pub output: Option<PathBuf>,
    pub transcription: TranscribeOptions,
    pub combined: CombinedOptions,
    pub voiceprints: Vec<Voiceprint>,
    pub identify: IdentifyOptions,
    /// Dispatch the diarize/identify stage asynchronously to this webhook.
    pub webhook_url: Option<String>,
    /// Discard any existing state and start from the first stage.
    pub force_restart: bool,
    /// Resume states older than the automatic cutoff.
    pub explicit_resume: bool,
}

impl PipelineRequest {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            kind: PipelineKind::Standard,
            output: None,
            transcription: TranscribeOptions::default(),
            combined: CombinedOptions::default(),
            voiceprints: Vec::new(),
            identify: IdentifyOptions::default(),
            webhook_url: None,
            force_restart: false,
            explicit_resume: false,
        }
    }
}

/// Result of one scheduler invocation.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed {
        pipeline_id: String,
        export_path: PathBuf,
        segments: Vec<FusedSegment>,
        executed: Vec<Stage>,
        skipped: Vec<Stage>,
    },
    /// A stage was dispatched asynchronously; re-invoke after the webhook
    /// delivers the result.
    AwaitingWebhook {
        pipeline_id: String,
        job: JobHandle,
    },
}

/// Asynchronous stage bookkeeping stored in the state metadata.
#[derive(Debug, Serialize, Deserialize)]
struct PendingJob {
    handle: JobHandle,
    stage: Stage,
    expected_output: PathBuf,
}

const PENDING_JOB_KEY: &str = "pending_job";
const MEDIA_URL_KEY: &str = "media_url";

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| ScrivanoError::Schema {
        message: format!("{}: {e}", path.display()),
    })
}

/// Interim artifact layout for one input file.
struct Interim {
    dir: PathBuf,
    stem: String,
}

impl Interim {
    fn new(dir: PathBuf, input: &Path) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        Self { dir, stem }
    }

    fn converted_wav(&self) -> PathBuf {
        self.dir.join(format!("{}_converted.wav", self.stem))
    }

    fn diarization(&self) -> PathBuf {
        self.dir.join(format!("{}_diarization.json", self.stem))
    }

    fn transcription(&self) -> PathBuf {
        self.dir.join(format!("{}_transcription.json", self.stem))
    }

    fn merged(&self) -> PathBuf {
        self.dir.join(format!("{}_merged.json", self.stem))
    }

    fn combined(&self) -> PathBuf {
        self.dir.join(format!("{}_replicate.json", self.stem))
    }

    fn identification(&self) -> PathBuf {
        self.dir.join(format!("{}_identification.json", self.stem))
    }
}

/// Executes pipelines against a checkpoint store.
pub struct PipelineScheduler {
    runtime: Arc<Runtime>,
    collaborators: Collaborators,
    store: Arc<CheckpointStore>,
    fuser: SegmentFuser,
    chunking: ChunkingConfig,
}

impl PipelineScheduler {
    pub fn new(runtime: Arc<Runtime>, collaborators: Collaborators) -> Result<Self> {
        let paths = &runtime.config.paths;
        std::fs::create_dir_all(paths.interim_dir())?;
        std::fs::create_dir_all(paths.processed_dir())?;
        let store = Arc::new(CheckpointStore::new(
            paths.checkpoints_dir(),
            runtime.config.retention.auto_resume_hours,
            runtime.config.retention.purge_hours,
        )?);
        Ok(Self {
            runtime,
            collaborators,
            store,
            fuser: SegmentFuser::new(),
            chunking: ChunkingConfig::default(),
        })
    }

    /// Overrides the chunking tuning (tests use scaled-down sizes).
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn store(&self) -> Arc<CheckpointStore> {
        self.store.clone()
    }

    /// Runs one pipeline to completion or to its first pending job.
    pub async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutcome> {
        upload::validate_input(&request.input)?;

        let canonical = self.runtime.config.canonical();
        let pipeline_id = CheckpointStore::pipeline_id(&request.input, &canonical);
        let _lock = self.store.lock(&pipeline_id)?;

        let fingerprint = CheckpointStore::input_fingerprint(&request.input)?;

        if request.force_restart {
            tracing::info!(%pipeline_id, "force restart requested; discarding state");
            self.store.delete(&pipeline_id)?;
        }

        let mut state = match self.store.load(&pipeline_id)? {
            Some(existing) => {
                match self.store.validate(&existing, &fingerprint, request.explicit_resume) {
                    StateValidity::Valid => {
                        tracing::info!(%pipeline_id, completed = existing.completed_stages.len(), "resuming pipeline");
                        existing
                    }
                    StateValidity::Stale(reason) => {
                        tracing::warn!(%pipeline_id, %reason, "discarding stale state");
                        self.store.delete(&pipeline_id)?;
                        PipelineState::new(
                            pipeline_id.clone(),
                            request.input.clone(),
                            fingerprint,
                            canonical.clone(),
                            request.kind,
                        )
                    }
                }
            }
            None => PipelineState::new(
                pipeline_id.clone(),
                request.input.clone(),
                fingerprint,
                canonical.clone(),
                request.kind,
            ),
        };

        let interim = Interim::new(self.runtime.config.paths.interim_dir(), &request.input);

        let result = match request.kind {
            PipelineKind::Standard => self.run_standard(&mut state, request, &interim).await,
            PipelineKind::Combined => self.run_combined(&mut state, request, &interim).await,
            PipelineKind::Identification => {
                self.run_identification(&mut state, request, &interim).await
            }
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err((stage, error)) => {
                self.store.record_failure(&mut state, stage, &error)?;
                Err(error.into_stage(stage.label(), 1))
            }
        }
    }

    fn check_cancelled(&self, stage: Stage) -> std::result::Result<(), (Stage, ScrivanoError)> {
        if self.runtime.cancel.is_cancelled() {
            Err((stage, ScrivanoError::Cancelled))
        } else {
            Ok(())
        }
    }

    fn export_path(&self, request: &PipelineRequest) -> PathBuf {
        request.output.clone().unwrap_or_else(|| {
            let stem = request
                .input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "transcript".to_string());
            self.runtime
                .config
                .paths
                .processed_dir()
                .join(format!("{stem}.json"))
        })
    }

    /// Upload stage: normalize and push to the provider's media storage.
    ///
    /// Returns the local WAV and the remote handle.
    async fn stage_upload(
        &self,
        state: &mut PipelineState,
        interim: &Interim,
        executed: &mut Vec<Stage>,
        skipped: &mut Vec<Stage>,
    ) -> std::result::Result<(PathBuf, MediaHandle), (Stage, ScrivanoError)> {
        let stage = Stage::Upload;
        self.check_cancelled(stage)?;
        let wav = interim.converted_wav();

        if state.is_completed(stage)
            && wav.exists()
            && let Some(checkpoint) = state.checkpoint_for(stage)
            && let Some(media_url) = checkpoint.metadata.get(MEDIA_URL_KEY).and_then(|v| v.as_str())
        {
            tracing::info!(stage = %stage, "skipped (checkpoint hit)");
            skipped.push(stage);
            return Ok((wav, MediaHandle(media_url.to_string())));
        }

        tracing::info!(stage = %stage, "executed");
        state.current_stage = Some(stage);
        self.store.save(state).map_err(|e| (stage, e))?;

        self.collaborators
            .converter
            .convert_to_wav(&state.input_file, &wav)
            .await
            .map_err(|e| (stage, e))?;
        let media = self
            .collaborators
            .media_store
            .upload(&wav)
            .await
            .map_err(|e| (stage, e))?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(MEDIA_URL_KEY.to_string(), json!(media.as_str()));
        self.store
            .record_success(state, stage, wav.to_string_lossy(), metadata)
            .map_err(|e| (stage, e))?;
        executed.push(stage);
        Ok((wav, media))
    }

    /// Parks an asynchronous job in the state and returns the handle.
    fn park_pending_job(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        handle: JobHandle,
        expected_output: PathBuf,
    ) -> Result<()> {
        let pending = PendingJob {
            handle,
            stage,
            expected_output,
        };
        state
            .metadata
            .insert(PENDING_JOB_KEY.to_string(), serde_json::to_value(&pending)?);
        state.current_stage = Some(stage);
        self.store.save(state)
    }

    fn pending_job(state: &PipelineState) -> Option<PendingJob> {
        state
            .metadata
            .get(PENDING_JOB_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    async fn run_standard(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        interim: &Interim,
    ) -> std::result::Result<PipelineOutcome, (Stage, ScrivanoError)> {
        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        let (wav, media) = self
            .stage_upload(state, interim, &mut executed, &mut skipped)
            .await?;

        // Asynchronous diarization: park the job and return.
        if !state.is_completed(Stage::Diarize)
            && let Some(webhook_url) = &request.webhook_url
        {
            if let Some(pending) = Self::pending_job(state) {
                tracing::info!(job_id = %pending.handle.job_id, "diarization still pending on webhook");
                return Ok(PipelineOutcome::AwaitingWebhook {
                    pipeline_id: state.pipeline_id.clone(),
                    job: pending.handle,
                });
            }
            let handle = self
                .collaborators
                .diarizer
                .diarize_async(&media, webhook_url)
                .await
                .map_err(|e| (Stage::Diarize, e))?;
            self.park_pending_job(state, Stage::Diarize, handle.clone(), interim.diarization())
                .map_err(|e| (Stage::Diarize, e))?;
            tracing::info!(job_id = %handle.job_id, "diarization dispatched to webhook");
            return Ok(PipelineOutcome::AwaitingWebhook {
                pipeline_id: state.pipeline_id.clone(),
                job: handle,
            });
        }

        self.check_cancelled(Stage::Diarize)?;

        // Diarization and transcription commute; run them concurrently and
        // join before fusing.
        let diar_skip = state.is_completed(Stage::Diarize);
        let trans_skip = state.is_completed(Stage::Transcribe);

        let diar_fut = async {
            if diar_skip
                && let Ok(segments) =
                    read_json_file::<Vec<DiarizationSegment>>(&interim.diarization())
                && types::validate_diarization(&segments).is_ok()
            {
                tracing::info!(stage = %Stage::Diarize, "skipped (checkpoint hit)");
                return Ok((segments, false));
            }
            tracing::info!(stage = %Stage::Diarize, "executed");
            let segments = self
                .collaborators
                .diarizer
                .diarize(&media)
                .await
                .map_err(|e| (Stage::Diarize, e))?;
            Ok((segments, true))
        };

        let trans_fut = async {
            if trans_skip
                && let Ok(segments) =
                    read_json_file::<Vec<TranscriptionSegment>>(&interim.transcription())
                && types::validate_transcription(&segments).is_ok()
            {
                tracing::info!(stage = %Stage::Transcribe, "skipped (checkpoint hit)");
                return Ok((segments, false));
            }
            tracing::info!(stage = %Stage::Transcribe, "executed");
            let transcriber = ChunkedTranscriber::with_config(
                self.collaborators.speech_to_text.clone(),
                self.chunking.clone(),
            );
            let segments = transcriber
                .transcribe(&wav, &request.transcription, &interim.dir, &self.runtime.cancel)
                .await
                .map_err(|e| (Stage::Transcribe, e))?;
            Ok((segments, true))
        };

        let (diar_result, trans_result) = tokio::join!(diar_fut, trans_fut);

        // Checkpoint whichever branches succeeded before surfacing a failure,
        // so the expensive completed work survives the retry.
        let mut first_error: Option<(Stage, ScrivanoError)> = None;

        let diarization = match diar_result {
            Ok((segments, ran)) => {
                if ran {
                    write_json_file(&interim.diarization(), &segments)
                        .map_err(|e| (Stage::Diarize, e))?;
                    self.store
                        .record_success(
                            state,
                            Stage::Diarize,
                            interim.diarization().to_string_lossy(),
                            serde_json::Map::new(),
                        )
                        .map_err(|e| (Stage::Diarize, e))?;
                    executed.push(Stage::Diarize);
                } else {
                    skipped.push(Stage::Diarize);
                }
                Some(segments)
            }
            Err(e) => {
                first_error = Some(e);
                None
            }
        };

        let transcription = match trans_result {
            Ok((segments, ran)) => {
                if ran {
                    write_json_file(&interim.transcription(), &segments)
                        .map_err(|e| (Stage::Transcribe, e))?;
                    self.store
                        .record_success(
                            state,
                            Stage::Transcribe,
                            interim.transcription().to_string_lossy(),
                            serde_json::Map::new(),
                        )
                        .map_err(|e| (Stage::Transcribe, e))?;
                    executed.push(Stage::Transcribe);
                } else {
                    skipped.push(Stage::Transcribe);
                }
                Some(segments)
            }
            Err(e) => {
                first_error.get_or_insert(e);
                None
            }
        };

        if let Some(error) = first_error {
            return Err(error);
        }
        let (diarization, transcription) =
            (diarization.expect("checked"), transcription.expect("checked"));

        // FUSE
        self.check_cancelled(Stage::Fuse)?;
        let fused = if state.is_completed(Stage::Fuse)
            && let Ok(segments) = read_json_file::<Vec<FusedSegment>>(&interim.merged())
            && types::validate_fused(&segments).is_ok()
        {
            tracing::info!(stage = %Stage::Fuse, "skipped (checkpoint hit)");
            skipped.push(Stage::Fuse);
            segments
        } else {
            tracing::info!(stage = %Stage::Fuse, "executed");
            let fused = self
                .fuser
                .fuse(&diarization, &transcription)
                .map_err(|e| (Stage::Fuse, e))?;
            write_json_file(&interim.merged(), &fused).map_err(|e| (Stage::Fuse, e))?;
            self.store
                .record_success(
                    state,
                    Stage::Fuse,
                    interim.merged().to_string_lossy(),
                    serde_json::Map::new(),
                )
                .map_err(|e| (Stage::Fuse, e))?;
            executed.push(Stage::Fuse);
            fused
        };

        let export_path = self
            .stage_export(state, request, &fused, &mut executed, &mut skipped)
            .await?;

        Ok(PipelineOutcome::Completed {
            pipeline_id: state.pipeline_id.clone(),
            export_path,
            segments: fused,
            executed,
            skipped,
        })
    }

    async fn run_combined(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        interim: &Interim,
    ) -> std::result::Result<PipelineOutcome, (Stage, ScrivanoError)> {
        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        let stage = Stage::Combined;
        self.check_cancelled(stage)?;

        let segments = if state.is_completed(stage)
            && let Ok(segments) = read_json_file::<Vec<FusedSegment>>(&interim.combined())
            && types::validate_fused(&segments).is_ok()
        {
            tracing::info!(stage = %stage, "skipped (checkpoint hit)");
            skipped.push(stage);
            segments
        } else {
            tracing::info!(stage = %stage, "executed");
            state.current_stage = Some(stage);
            self.store.save(state).map_err(|e| (stage, e))?;

            let segments = self
                .collaborators
                .combined
                .diarize_and_transcribe(&state.input_file, &request.combined)
                .await
                .map_err(|e| (stage, e))?;
            write_json_file(&interim.combined(), &segments).map_err(|e| (stage, e))?;
            self.store
                .record_success(
                    state,
                    stage,
                    interim.combined().to_string_lossy(),
                    serde_json::Map::new(),
                )
                .map_err(|e| (stage, e))?;
            executed.push(stage);
            segments
        };

        let export_path = self
            .stage_export(state, request, &segments, &mut executed, &mut skipped)
            .await?;

        Ok(PipelineOutcome::Completed {
            pipeline_id: state.pipeline_id.clone(),
            export_path,
            segments,
            executed,
            skipped,
        })
    }

    async fn run_identification(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        interim: &Interim,
    ) -> std::result::Result<PipelineOutcome, (Stage, ScrivanoError)> {
        if request.voiceprints.is_empty() {
            return Err((
                Stage::Identify,
                ScrivanoError::Validation {
                    message: "identification needs at least one voiceprint".to_string(),
                },
            ));
        }

        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        let (_wav, media) = self
            .stage_upload(state, interim, &mut executed, &mut skipped)
            .await?;

        let stage = Stage::Identify;
        self.check_cancelled(stage)?;

        // Asynchronous identification mirrors the diarize webhook path.
        if !state.is_completed(stage)
            && let Some(webhook_url) = &request.webhook_url
        {
            if let Some(pending) = Self::pending_job(state) {
                return Ok(PipelineOutcome::AwaitingWebhook {
                    pipeline_id: state.pipeline_id.clone(),
                    job: pending.handle,
                });
            }
            // The provider treats an identify submission with a webhook the
            // same way as diarize; reuse the diarize dispatch.
            let handle = self
                .collaborators
                .diarizer
                .diarize_async(&media, webhook_url)
                .await
                .map_err(|e| (stage, e))?;
            self.park_pending_job(state, stage, handle.clone(), interim.identification())
                .map_err(|e| (stage, e))?;
            return Ok(PipelineOutcome::AwaitingWebhook {
                pipeline_id: state.pipeline_id.clone(),
                job: handle,
            });
        }

        let segments = if state.is_completed(stage)
            && let Ok(segments) =
                read_json_file::<Vec<DiarizationSegment>>(&interim.identification())
            && types::validate_diarization(&segments).is_ok()
        {
            tracing::info!(stage = %stage, "skipped (checkpoint hit)");
            skipped.push(stage);
            segments
        } else {
            tracing::info!(stage = %stage, "executed");
            state.current_stage = Some(stage);
            self.store.save(state).map_err(|e| (stage, e))?;

            let segments = self
                .collaborators
                .diarizer
                .identify(&media, &request.voiceprints, &request.identify)
                .await
                .map_err(|e| (stage, e))?;
            write_json_file(&interim.identification(), &segments).map_err(|e| (stage, e))?;
            self.store
                .record_success(
                    state,
                    stage,
                    interim.identification().to_string_lossy(),
                    serde_json::Map::new(),
                )
                .map_err(|e| (stage, e))?;
            executed.push(stage);
            segments
        };

        let fused = identification_to_fused(&segments);
        let export_path = self
            .stage_export(state, request, &fused, &mut executed, &mut skipped)
            .await?;

        Ok(PipelineOutcome::Completed {
            pipeline_id: state.pipeline_id.clone(),
            export_path,
            segments: fused,
            executed,
            skipped,
        })
    }

    async fn stage_export(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        segments: &[FusedSegment],
        executed: &mut Vec<Stage>,
        skipped: &mut Vec<Stage>,
    ) -> std::result::Result<PathBuf, (Stage, ScrivanoError)> {
        let stage = Stage::Export;
        self.check_cancelled(stage)?;
        let dest = self.export_path(request);

        if state.is_completed(stage) && dest.exists() {
            tracing::info!(stage = %stage, "skipped (checkpoint hit)");
            skipped.push(stage);
            return Ok(dest);
        }

        tracing::info!(stage = %stage, "executed");
        state.current_stage = Some(stage);
        self.store.save(state).map_err(|e| (stage, e))?;

        let written = self
            .collaborators
            .exporter
            .export(segments, &dest)
            .map_err(|e| (stage, e))?;
        self.store
            .record_success(
                state,
                stage,
                written.to_string_lossy(),
                serde_json::Map::new(),
            )
            .map_err(|e| (stage, e))?;
        executed.push(stage);
        Ok(written)
    }

    /// Spawns the periodic retention purge.
    pub fn spawn_retention_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let cancel = self.runtime.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.purge_expired() {
                            tracing::warn!(error = %e, "retention purge failed");
                        }
                    }
                }
            }
        })
    }
}

/// Completes a parked asynchronous stage from a webhook event.
///
/// Scans the store for a state whose pending job matches `event.job_id`,
/// writes the stage output to the expected path and flips the stage status.
/// Returns the pipeline id if a pending job matched.
pub fn complete_pending_job(
    store: &CheckpointStore,
    event: &WebhookEvent,
) -> Result<Option<String>> {
    for summary in store.list()? {
        let Some(mut state) = store.load(&summary.pipeline_id)? else {
            continue;
        };
        let Some(pending_value) = state.metadata.get(PENDING_JOB_KEY) else {
            continue;
        };
        let pending: PendingJob =
            serde_json::from_value(pending_value.clone()).map_err(|e| ScrivanoError::Schema {
                message: format!("pending job record: {e}"),
            })?;
        if pending.handle.job_id != event.job_id {
            continue;
        }

        state.metadata.remove(PENDING_JOB_KEY);

        if event.status != JobStatus::Succeeded {
            let error = ScrivanoError::Provider {
                provider: "diarization".to_string(),
                status: 0,
                message: format!("webhook reported job {} as {:?}", event.job_id, event.status),
            };
            store.record_failure(&mut state, pending.stage, &error)?;
            return Ok(Some(state.pipeline_id.clone()));
        }

        let output = event.output.as_ref().ok_or_else(|| ScrivanoError::Schema {
            message: format!("webhook event {} has no output", event.job_id),
        })?;
        let segments = parse_segments_output(output)?;
        write_json_file(&pending.expected_output, &segments)?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("job_id".to_string(), json!(event.job_id));
        let output_ref = pending.expected_output.to_string_lossy().into_owned();
        store.record_success(&mut state, pending.stage, output_ref, metadata)?;

        tracing::info!(
            pipeline_id = %state.pipeline_id,
            stage = %pending.stage,
            job_id = %event.job_id,
            "pending stage completed via webhook"
        );
        return Ok(Some(state.pipeline_id.clone()));
    }
    Ok(None)
}
