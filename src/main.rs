use anyhow::{Context, Result};
use clap::Parser;
use scrivano::checkpoint::PipelineKind;
use scrivano::cli::{CheckpointCommands, Cli, Commands};
use scrivano::config::Config;
use scrivano::convert::FfmpegConverter;
use scrivano::export::JsonExporter;
use scrivano::providers::transcription::TranscriptionModel;
use scrivano::providers::{
    CombinedClient, CombinedOptions, DiarizationClient, TranscribeOptions, TranscriptionClient,
};
use scrivano::scheduler::{Collaborators, PipelineRequest, PipelineScheduler, Runtime};
use scrivano::types::Voiceprint;
use scrivano::upload::MediaUploader;
use scrivano::webhook::WebhookServer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?
        .with_env_overrides();
    config.validate()?;

    match cli.command {
        Commands::Run {
            input,
            output,
            model,
            language,
            prompt,
            use_combined,
            num_speakers,
            voiceprints,
            matching_threshold,
            webhook_url,
            force_restart,
            resume,
        } => {
            let runtime = Arc::new(Runtime::new(config));
            let scheduler = build_scheduler(runtime.clone())?;

            // Ctrl-C cancels cooperatively: in-flight calls abort, no
            // checkpoint advances.
            let cancel = runtime.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; cancelling pipeline");
                    cancel.cancel();
                }
            });

            let mut request = PipelineRequest::new(&input);
            request.output = output;
            request.webhook_url = webhook_url;
            request.force_restart = force_restart;
            request.explicit_resume = resume;
            request.transcription = TranscribeOptions {
                model: match &model {
                    Some(name) => TranscriptionModel::parse(name)?,
                    None => TranscriptionModel::parse(
                        &runtime.config.providers.transcription.model,
                    )?,
                },
                language: language
                    .clone()
                    .or_else(|| runtime.config.providers.transcription.language.clone()),
                prompt: (!prompt.is_empty()).then_some(prompt),
            };

            if use_combined {
                request.kind = PipelineKind::Combined;
                request.combined = CombinedOptions {
                    language,
                    num_speakers,
                    prompt: request.transcription.prompt.clone(),
                };
            } else if let Some(path) = voiceprints {
                request.kind = PipelineKind::Identification;
                request.voiceprints = load_voiceprints(&path)?;
                request.identify.matching_threshold = matching_threshold;
            }

            let retention = scheduler.spawn_retention_task(Duration::from_secs(3600));
            let outcome = scheduler.run(&request).await?;
            retention.abort();

            match outcome {
                scrivano::PipelineOutcome::Completed {
                    export_path,
                    segments,
                    executed,
                    skipped,
                    ..
                } => {
                    tracing::info!(
                        segments = segments.len(),
                        executed = executed.len(),
                        skipped = skipped.len(),
                        "pipeline finished"
                    );
                    println!("{}", export_path.display());
                }
                scrivano::PipelineOutcome::AwaitingWebhook { job, pipeline_id } => {
                    tracing::info!(%pipeline_id, job_id = %job.job_id, "job dispatched; re-run after the webhook fires");
                    println!("awaiting webhook for job {}", job.job_id);
                }
            }
        }

        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.webhook.host.clone());
            let port = port.unwrap_or(config.webhook.port);
            let store = Arc::new(scrivano::checkpoint::CheckpointStore::new(
                config.paths.checkpoints_dir(),
                config.retention.auto_resume_hours,
                config.retention.purge_hours,
            )?);
            let server = Arc::new(
                WebhookServer::new(config.webhook.secret.clone(), config.paths.interim_dir())?
                    .with_store(store),
            );
            server.serve(&host, port).await?;
        }

        Commands::Checkpoints { command } => {
            let store = scrivano::checkpoint::CheckpointStore::new(
                config.paths.checkpoints_dir(),
                config.retention.auto_resume_hours,
                config.retention.purge_hours,
            )?;
            match command {
                CheckpointCommands::List => {
                    for summary in store.list()? {
                        println!(
                            "{}  {:12}  {}  {}",
                            summary.pipeline_id,
                            summary.status,
                            summary.last_updated.format("%Y-%m-%d %H:%M"),
                            summary.input_file.display()
                        );
                    }
                }
                CheckpointCommands::Show { pipeline_id } => {
                    match store.summary(&pipeline_id)? {
                        Some(summary) => {
                            println!("{}", serde_json::to_string_pretty(&summary)?)
                        }
                        None => println!("no state for {pipeline_id}"),
                    }
                }
                CheckpointCommands::Delete { pipeline_id } => {
                    store.delete(&pipeline_id)?;
                    println!("deleted {pipeline_id}");
                }
                CheckpointCommands::Purge => {
                    let removed = store.purge_expired()?;
                    println!("purged {removed} state(s)");
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "scrivano=info",
        1 => "scrivano=debug",
        _ => "scrivano=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn build_scheduler(runtime: Arc<Runtime>) -> Result<PipelineScheduler> {
    let providers = &runtime.config.providers;
    let budget = runtime.budget.clone();
    let retry = runtime.retry.clone();

    let collaborators = Collaborators {
        converter: Arc::new(FfmpegConverter::new()),
        media_store: Arc::new(MediaUploader::new(
            providers.diarization.base_url.clone(),
            providers.diarization.api_token.clone(),
            budget.clone(),
            retry.clone(),
        )),
        diarizer: Arc::new(DiarizationClient::new(
            providers.diarization.base_url.clone(),
            providers.diarization.api_token.clone(),
            budget.clone(),
            retry.clone(),
        )),
        speech_to_text: Arc::new(TranscriptionClient::new(
            providers.transcription.base_url.clone(),
            providers.transcription.api_token.clone(),
            budget.clone(),
            retry.clone(),
        )),
        combined: Arc::new(CombinedClient::new(
            providers.combined.base_url.clone(),
            providers.combined.api_token.clone(),
            providers.combined.model_version.clone(),
            budget,
            retry,
        )),
        exporter: Arc::new(JsonExporter),
    };

    Ok(PipelineScheduler::new(runtime, collaborators)?)
}

fn load_voiceprints(path: &Path) -> Result<Vec<Voiceprint>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading voiceprints from {}", path.display()))?;
    let voiceprints: Vec<Voiceprint> = serde_json::from_str(&contents)
        .with_context(|| format!("parsing voiceprints from {}", path.display()))?;
    Ok(voiceprints)
}
