//! scrivano - speaker-attributed transcripts from recordings
//!
//! Batch pipeline orchestrating remote diarization, speech-to-text and
//! combined providers, with checkpoint-based resumption and a webhook
//! endpoint for asynchronous job completion.

pub mod budget;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod convert;
pub mod defaults;
pub mod error;
pub mod export;
pub mod fuse;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod transcribe;
pub mod types;
pub mod upload;
pub mod webhook;

pub use config::Config;
pub use error::{Result, ScrivanoError};
pub use scheduler::{PipelineOutcome, PipelineRequest, PipelineScheduler, Runtime};
