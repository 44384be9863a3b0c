//! Pipeline state persistence and checkpoint validation.
//!
//! One state file per input+config combination, written atomically
//! (temp + fsync + rename) after every checkpoint. Checkpoints are appended
//! monotonically and never rewritten in place. A lock file serializes
//! concurrent runs of the same pipeline.

use crate::error::{Result, ScrivanoError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One node of the pipeline DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Diarize,
    Transcribe,
    Fuse,
    Export,
    Combined,
    Identify,
}

impl Stage {
    /// The stage label used in filenames, events and logging.
    pub fn label(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Diarize => "diarize",
            Self::Transcribe => "transcribe",
            Self::Fuse => "fuse",
            Self::Export => "export",
            Self::Combined => "combined",
            Self::Identify => "identify",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which stage sequence a run follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Upload, then diarize and transcribe concurrently, fuse, export.
    Standard,
    /// Single combined diarize+transcribe call, then export.
    Combined,
    /// Upload, identify against voiceprints, export.
    Identification,
}

impl PipelineKind {
    /// Ordered stages of this pipeline. The standard pipeline's diarize and
    /// transcribe stages run concurrently; both precede fuse.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::Standard => &[
                Stage::Upload,
                Stage::Diarize,
                Stage::Transcribe,
                Stage::Fuse,
                Stage::Export,
            ],
            Self::Combined => &[Stage::Combined, Stage::Export],
            Self::Identification => &[Stage::Upload, Stage::Identify, Stage::Export],
        }
    }
}

/// Record of one finished (or failed) stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub input_ref: String,
    pub output_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Persisted pipeline state; one per input+config combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub input_file: PathBuf,
    pub input_fingerprint: String,
    pub config_fingerprint: String,
    pub kind: PipelineKind,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completed_stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PipelineState {
    pub fn new(
        pipeline_id: String,
        input_file: PathBuf,
        input_fingerprint: String,
        config_fingerprint: String,
        kind: PipelineKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            input_file,
            input_fingerprint,
            config_fingerprint,
            kind,
            created_at: now,
            last_updated: now,
            completed_stages: Vec::new(),
            current_stage: None,
            failed_stage: None,
            checkpoints: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Latest successful checkpoint for a stage, if any.
    pub fn checkpoint_for(&self, stage: Stage) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.stage == stage && c.success)
    }

    /// All stages of this pipeline finished successfully.
    pub fn is_terminal(&self) -> bool {
        self.kind.stages().iter().all(|s| self.is_completed(*s))
    }
}

/// Why a persisted state cannot be resumed automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValidity {
    Valid,
    /// State exists but must be discarded or explicitly resumed.
    Stale(String),
}

/// Run summary derived from a persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub input_file: PathBuf,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completed_stages: Vec<Stage>,
    pub failed_stage: Option<Stage>,
    pub total_checkpoints: usize,
    pub successful_checkpoints: usize,
}

/// Exclusive lock on one pipeline's state; removed on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove state lock");
        }
    }
}

/// File-backed checkpoint store.
pub struct CheckpointStore {
    dir: PathBuf,
    auto_resume_max_age: ChronoDuration,
    retention: ChronoDuration,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf, auto_resume_hours: i64, purge_hours: i64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            auto_resume_max_age: ChronoDuration::hours(auto_resume_hours),
            retention: ChronoDuration::hours(purge_hours),
        })
    }

    /// Derives the pipeline id from the input path and canonical config.
    ///
    /// The same input with a different config is a different pipeline.
    pub fn pipeline_id(input: &Path, canonical_config: &str) -> String {
        let canonical_input = input
            .canonicalize()
            .unwrap_or_else(|_| input.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical_input.to_string_lossy().as_bytes());
        hasher.update(b"\x00");
        hasher.update(canonical_config.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Content hash of the input file.
    pub fn input_fingerprint(input: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        let mut file = fs::File::open(input)?;
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn state_path(&self, pipeline_id: &str) -> PathBuf {
        self.dir.join(format!("{pipeline_id}_state.json"))
    }

    fn lock_path(&self, pipeline_id: &str) -> PathBuf {
        self.dir.join(format!("{pipeline_id}.lock"))
    }

    /// Takes the exclusive lock for a pipeline.
    ///
    /// A second starter observing a live lock fails fast.
    pub fn lock(&self, pipeline_id: &str) -> Result<StateLock> {
        let path = self.lock_path(pipeline_id);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(StateLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ScrivanoError::AlreadyRunning {
                    pipeline_id: pipeline_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads a persisted state, if present.
    pub fn load(&self, pipeline_id: &str) -> Result<Option<PipelineState>> {
        let path = self.state_path(pipeline_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: PipelineState =
            serde_json::from_str(&contents).map_err(|e| ScrivanoError::Schema {
                message: format!("state file {}: {e}", path.display()),
            })?;
        Ok(Some(state))
    }

    /// Persists a state atomically: temp file in the same directory, fsync,
    /// rename over the target.
    pub fn save(&self, state: &mut PipelineState) -> Result<()> {
        state.last_updated = Utc::now();

        let path = self.state_path(&state.pipeline_id);
        let tmp = self.dir.join(format!(".{}_state.json.tmp", state.pipeline_id));

        let json = serde_json::to_string_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(pipeline_id = %state.pipeline_id, "state persisted");
        Ok(())
    }

    /// Appends a successful checkpoint and persists the state.
    pub fn record_success(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        output_ref: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let output_ref = output_ref.into();
        state.checkpoints.push(Checkpoint {
            stage,
            timestamp: Utc::now(),
            input_ref: state.input_file.to_string_lossy().into_owned(),
            output_ref: output_ref.clone(),
            metadata,
            success: true,
            error_message: None,
        });
        if !state.completed_stages.contains(&stage) {
            state.completed_stages.push(stage);
        }
        state.current_stage = None;
        state.failed_stage = None;
        tracing::info!(pipeline_id = %state.pipeline_id, stage = %stage, output = %output_ref, "checkpoint recorded");
        self.save(state)
    }

    /// Appends a failed checkpoint and persists the state.
    pub fn record_failure(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        error: &ScrivanoError,
    ) -> Result<()> {
        state.checkpoints.push(Checkpoint {
            stage,
            timestamp: Utc::now(),
            input_ref: state.input_file.to_string_lossy().into_owned(),
            output_ref: String::new(),
            metadata: serde_json::Map::new(),
            success: false,
            error_message: Some(error.to_string()),
        });
        state.failed_stage = Some(stage);
        state.current_stage = None;
        tracing::error!(pipeline_id = %state.pipeline_id, stage = %stage, error = %error, "stage failed");
        self.save(state)
    }

    /// Checks whether a persisted state can seed a resume.
    ///
    /// Valid iff the input file still exists with the recorded content hash,
    /// every successful checkpoint's output file exists, and the state is
    /// young enough (unless the caller asked for an explicit resume).
    pub fn validate(
        &self,
        state: &PipelineState,
        input_fingerprint: &str,
        explicit_resume: bool,
    ) -> StateValidity {
        if !state.input_file.exists() {
            return StateValidity::Stale(format!(
                "input file {} no longer exists",
                state.input_file.display()
            ));
        }
        if state.input_fingerprint != input_fingerprint {
            return StateValidity::Stale("input file content changed".to_string());
        }

        // Only intermediate outputs gate resumption; a deleted final export
        // simply re-runs the export stage.
        for checkpoint in state
            .checkpoints
            .iter()
            .filter(|c| c.success && c.stage != Stage::Export)
        {
            if checkpoint.output_ref.is_empty() {
                continue;
            }
            if !Path::new(&checkpoint.output_ref).exists() {
                return StateValidity::Stale(format!(
                    "stage {} output {} is missing",
                    checkpoint.stage, checkpoint.output_ref
                ));
            }
        }

        if !explicit_resume {
            let age = Utc::now() - state.last_updated;
            if age > self.auto_resume_max_age {
                return StateValidity::Stale(format!(
                    "state is {}h old; automatic resume is capped at {}h",
                    age.num_hours(),
                    self.auto_resume_max_age.num_hours()
                ));
            }
        }

        StateValidity::Valid
    }

    /// Removes a pipeline's state file.
    pub fn delete(&self, pipeline_id: &str) -> Result<()> {
        match fs::remove_file(self.state_path(pipeline_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Purges states idle past the retention window. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.retention;
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with("_state.json") || name.starts_with('.') {
                continue;
            }

            let expired = fs::read_to_string(entry.path())
                .ok()
                .and_then(|contents| serde_json::from_str::<PipelineState>(&contents).ok())
                .is_none_or(|state| state.last_updated < cutoff);

            if expired {
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(file = %entry.path().display(), error = %e, "purge failed");
                } else {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "purged expired pipeline states");
        }
        Ok(removed)
    }

    /// Summary of one persisted state.
    pub fn summary(&self, pipeline_id: &str) -> Result<Option<PipelineSummary>> {
        let Some(state) = self.load(pipeline_id)? else {
            return Ok(None);
        };

        let status = if state.failed_stage.is_some() {
            "failed"
        } else if state.is_terminal() {
            "completed"
        } else if state.completed_stages.is_empty() {
            "not_started"
        } else {
            "in_progress"
        };

        let successful = state.checkpoints.iter().filter(|c| c.success).count();
        Ok(Some(PipelineSummary {
            pipeline_id: state.pipeline_id.clone(),
            input_file: state.input_file.clone(),
            status: status.to_string(),
            created_at: state.created_at,
            last_updated: state.last_updated,
            completed_stages: state.completed_stages.clone(),
            failed_stage: state.failed_stage,
            total_checkpoints: state.checkpoints.len(),
            successful_checkpoints: successful,
        }))
    }

    /// All state summaries in the store.
    pub fn list(&self) -> Result<Vec<PipelineSummary>> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix("_state.json")
                && !name.starts_with('.')
                && let Some(summary) = self.summary(id)?
            {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.to_path_buf(), 24, 48).unwrap()
    }

    fn make_state(dir: &Path, id: &str) -> PipelineState {
        let input = dir.join("input.wav");
        fs::write(&input, b"fake audio bytes").unwrap();
        let fingerprint = CheckpointStore::input_fingerprint(&input).unwrap();
        PipelineState::new(
            id.to_string(),
            input,
            fingerprint,
            "config-fp".to_string(),
            PipelineKind::Standard,
        )
    }

    #[test]
    fn test_pipeline_id_is_stable_and_config_sensitive() {
        let a = CheckpointStore::pipeline_id(Path::new("/tmp/a.wav"), "config-1");
        let b = CheckpointStore::pipeline_id(Path::new("/tmp/a.wav"), "config-1");
        let c = CheckpointStore::pipeline_id(Path::new("/tmp/a.wav"), "config-2");
        let d = CheckpointStore::pipeline_id(Path::new("/tmp/b.wav"), "config-1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");

        store.save(&mut state).unwrap();
        let loaded = store.load("p1").unwrap().unwrap();

        assert_eq!(loaded.pipeline_id, "p1");
        assert_eq!(loaded.input_fingerprint, state.input_fingerprint);
        assert_eq!(loaded.kind, PipelineKind::Standard);
        assert!(loaded.completed_stages.is_empty());
    }

    #[test]
    fn test_reserialized_state_is_canonical() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");
        store.save(&mut state).unwrap();

        let on_disk = fs::read_to_string(store.state_path("p1")).unwrap();
        let loaded = store.load("p1").unwrap().unwrap();
        let reserialized = serde_json::to_string_pretty(&loaded).unwrap();
        assert_eq!(on_disk, reserialized);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_load_rejects_corrupt_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.state_path("bad"), "{ not json").unwrap();

        assert!(matches!(
            store.load("bad"),
            Err(ScrivanoError::Schema { .. })
        ));
    }

    #[test]
    fn test_record_success_appends_monotonically() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");

        let output = dir.path().join("diarization.json");
        fs::write(&output, "[]").unwrap();

        store
            .record_success(
                &mut state,
                Stage::Upload,
                output.to_string_lossy(),
                serde_json::Map::new(),
            )
            .unwrap();
        store
            .record_success(
                &mut state,
                Stage::Diarize,
                output.to_string_lossy(),
                serde_json::Map::new(),
            )
            .unwrap();

        assert_eq!(state.checkpoints.len(), 2);
        assert_eq!(state.completed_stages, vec![Stage::Upload, Stage::Diarize]);
        assert!(state.is_completed(Stage::Upload));
        assert!(!state.is_completed(Stage::Fuse));
        assert!(state.checkpoint_for(Stage::Diarize).is_some());
    }

    #[test]
    fn test_record_failure_sets_failed_stage() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");

        let error = ScrivanoError::RateLimited {
            provider: "diarization".to_string(),
        };
        store.record_failure(&mut state, Stage::Diarize, &error).unwrap();

        assert_eq!(state.failed_stage, Some(Stage::Diarize));
        let checkpoint = state.checkpoints.last().unwrap();
        assert!(!checkpoint.success);
        assert!(checkpoint.error_message.as_ref().unwrap().contains("Rate limited"));
    }

    #[test]
    fn test_validate_accepts_fresh_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = make_state(dir.path(), "p1");
        let fingerprint = state.input_fingerprint.clone();

        assert_eq!(store.validate(&state, &fingerprint, false), StateValidity::Valid);
    }

    #[test]
    fn test_validate_rejects_changed_input() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = make_state(dir.path(), "p1");

        fs::write(&state.input_file, b"different bytes now").unwrap();
        let new_fingerprint = CheckpointStore::input_fingerprint(&state.input_file).unwrap();

        assert!(matches!(
            store.validate(&state, &new_fingerprint, false),
            StateValidity::Stale(_)
        ));
    }

    #[test]
    fn test_validate_rejects_missing_output() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");
        let fingerprint = state.input_fingerprint.clone();

        let output = dir.path().join("gone.json");
        fs::write(&output, "[]").unwrap();
        store
            .record_success(
                &mut state,
                Stage::Diarize,
                output.to_string_lossy(),
                serde_json::Map::new(),
            )
            .unwrap();
        fs::remove_file(&output).unwrap();

        assert!(matches!(
            store.validate(&state, &fingerprint, false),
            StateValidity::Stale(_)
        ));
    }

    #[test]
    fn test_validate_rejects_old_state_without_explicit_resume() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");
        let fingerprint = state.input_fingerprint.clone();

        state.last_updated = Utc::now() - ChronoDuration::hours(30);

        assert!(matches!(
            store.validate(&state, &fingerprint, false),
            StateValidity::Stale(_)
        ));
        // Explicit resume overrides the age cutoff
        assert_eq!(store.validate(&state, &fingerprint, true), StateValidity::Valid);
    }

    #[test]
    fn test_lock_blocks_second_starter() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let lock = store.lock("p1").unwrap();
        assert!(matches!(
            store.lock("p1"),
            Err(ScrivanoError::AlreadyRunning { .. })
        ));
        drop(lock);

        // Lock is released on drop
        assert!(store.lock("p1").is_ok());
    }

    #[test]
    fn test_purge_removes_only_expired_states() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut fresh = make_state(dir.path(), "fresh");
        store.save(&mut fresh).unwrap();

        let mut old = make_state(dir.path(), "old");
        store.save(&mut old).unwrap();
        // Rewrite with a stale last_updated, bypassing save()'s touch
        let mut on_disk = store.load("old").unwrap().unwrap();
        on_disk.last_updated = Utc::now() - ChronoDuration::hours(72);
        fs::write(
            store.state_path("old"),
            serde_json::to_string_pretty(&on_disk).unwrap(),
        )
        .unwrap();

        let removed = store.purge_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("fresh").unwrap().is_some());
        assert!(store.load("old").unwrap().is_none());
    }

    #[test]
    fn test_summary_status_transitions() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = make_state(dir.path(), "p1");
        store.save(&mut state).unwrap();

        assert_eq!(store.summary("p1").unwrap().unwrap().status, "not_started");

        let output = dir.path().join("out.json");
        fs::write(&output, "[]").unwrap();
        for stage in PipelineKind::Standard.stages() {
            store
                .record_success(
                    &mut state,
                    *stage,
                    output.to_string_lossy(),
                    serde_json::Map::new(),
                )
                .unwrap();
        }
        assert_eq!(store.summary("p1").unwrap().unwrap().status, "completed");

        let error = ScrivanoError::Cancelled;
        store.record_failure(&mut state, Stage::Export, &error).unwrap();
        assert_eq!(store.summary("p1").unwrap().unwrap().status, "failed");
    }

    #[test]
    fn test_list_orders_by_recency() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut first = make_state(dir.path(), "first");
        store.save(&mut first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut second = make_state(dir.path(), "second");
        store.save(&mut second).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].pipeline_id, "second");
    }
}
