//! Command-line interface for scrivano
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Speaker-attributed transcripts from recordings
#[derive(Parser, Debug)]
#[command(name = "scrivano", version, about = "Speaker-attributed transcripts from recordings")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a recording into a speaker-attributed transcript
    Run {
        /// Audio or video file to process
        input: PathBuf,

        /// Where to write the final transcript (default: processed/{stem}.json)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Transcription model (whisper-1, gpt-4o-mini-transcribe, gpt-4o-transcribe)
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Language code hint for transcription (en, de, fr, ...)
        #[arg(long, value_name = "LANG")]
        language: Option<String>,

        /// Contextual prompt carried into the transcription model
        #[arg(long, default_value = "")]
        prompt: String,

        /// Use the combined diarization+transcription provider instead of
        /// the standard pipeline
        #[arg(long)]
        use_combined: bool,

        /// Speaker-count hint for the combined provider
        #[arg(long, value_name = "N")]
        num_speakers: Option<u32>,

        /// Identify speakers against the voiceprints in this JSON file
        /// instead of plain diarization
        #[arg(long, value_name = "PATH")]
        voiceprints: Option<PathBuf>,

        /// Similarity threshold for voiceprint matching (0.0-1.0)
        #[arg(long, default_value_t = crate::defaults::IDENTIFY_MATCHING_THRESHOLD)]
        matching_threshold: f64,

        /// Dispatch provider jobs asynchronously to this webhook URL
        #[arg(long, value_name = "URL")]
        webhook_url: Option<String>,

        /// Discard existing checkpoints and start from scratch
        #[arg(long)]
        force_restart: bool,

        /// Resume a pipeline state older than the automatic cutoff
        #[arg(long)]
        resume: bool,
    },

    /// Serve the webhook endpoint for asynchronous job completion
    Serve {
        /// Bind address override
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Port override
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Inspect and maintain pipeline checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List all persisted pipeline states
    List,
    /// Show one pipeline state in detail
    Show {
        /// Pipeline id (as shown by `checkpoints list`)
        pipeline_id: String,
    },
    /// Delete one pipeline state
    Delete {
        /// Pipeline id to delete
        pipeline_id: String,
    },
    /// Purge states past the retention window
    Purge,
}
