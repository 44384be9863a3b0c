//! End-to-end test of the asynchronous completion path: a pipeline parks a
//! diarization job, the webhook endpoint receives the signed callback, and
//! the next scheduler invocation finishes from the checkpoint.

use axum::http::StatusCode;
use hound::{SampleFormat, WavSpec, WavWriter};
use scrivano::checkpoint::Stage;
use scrivano::config::Config;
use scrivano::convert::MockConverter;
use scrivano::export::JsonExporter;
use scrivano::providers::combined::MockCombinedPipeline;
use scrivano::providers::{MockDiarizer, MockSpeechToText};
use scrivano::scheduler::{Collaborators, PipelineOutcome, PipelineRequest, PipelineScheduler, Runtime};
use scrivano::types::TranscriptionSegment;
use scrivano::upload::MockMediaStore;
use scrivano::webhook::{WebhookServer, sign};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const SECRET: &str = "integration-test-secret";

fn write_wav(path: &Path, seconds: f64) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let samples = (seconds * 16_000.0) as usize;
    for i in 0..samples {
        let value = if i % 2 == 0 { 4000i16 } else { -4000i16 };
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
}

fn scheduler_with_mocks(data_root: &Path) -> PipelineScheduler {
    let mut config = Config::default();
    config.paths.data_root = data_root.to_path_buf();
    let runtime = Arc::new(Runtime::new(config));

    let collaborators = Collaborators {
        converter: Arc::new(MockConverter::new()),
        media_store: Arc::new(MockMediaStore::new()),
        diarizer: Arc::new(MockDiarizer::new()),
        speech_to_text: Arc::new(MockSpeechToText::new().with_segments(vec![
            TranscriptionSegment::new(0.0, 0.9, "first utterance"),
            TranscriptionSegment::new(1.1, 1.9, "second utterance"),
        ])),
        combined: Arc::new(MockCombinedPipeline::new()),
        exporter: Arc::new(JsonExporter),
    };

    PipelineScheduler::new(runtime, collaborators).unwrap()
}

#[tokio::test]
async fn async_diarization_completes_through_webhook() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("standup.wav");
    write_wav(&input, 2.0);

    let scheduler = scheduler_with_mocks(dir.path());

    let mut request = PipelineRequest::new(&input);
    request.webhook_url = Some("https://pipeline.example/webhook".to_string());

    // First invocation dispatches diarization and parks
    let job = match scheduler.run(&request).await.unwrap() {
        PipelineOutcome::AwaitingWebhook { job, .. } => job,
        other => panic!("expected a parked job, got {other:?}"),
    };

    // The provider calls back with a signed delivery
    let server = Arc::new(
        WebhookServer::new(SECRET, dir.path().join("interim"))
            .unwrap()
            .with_store(scheduler.store()),
    );
    let body = serde_json::to_vec(&json!({
        "job_id": job.job_id,
        "status": "succeeded",
        "output": {
            "diarization": [
                { "start": 0.0, "end": 1.0, "speaker": "SPEAKER_00" },
                { "start": 1.0, "end": 2.0, "speaker": "SPEAKER_01" }
            ]
        }
    }))
    .unwrap();
    let signature = sign(SECRET, "1724000000", &body);
    let (status, _) = server.process(Some("1724000000"), Some(&signature), None, None, &body);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server.metrics().successful_events(), 1);

    // The next invocation resumes from the webhook-written checkpoint
    let outcome = scheduler.run(&request).await.unwrap();
    match outcome {
        PipelineOutcome::Completed {
            segments,
            executed,
            skipped,
            export_path,
            ..
        } => {
            assert!(skipped.contains(&Stage::Diarize), "diarize was {executed:?}");
            assert!(executed.contains(&Stage::Transcribe));
            assert!(export_path.exists());

            assert_eq!(segments.len(), 2);
            assert_eq!(segments[0].speaker, "SPEAKER_00");
            assert_eq!(segments[1].speaker, "SPEAKER_01");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn tampered_webhook_never_reaches_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("standup.wav");
    write_wav(&input, 2.0);

    let scheduler = scheduler_with_mocks(dir.path());
    let mut request = PipelineRequest::new(&input);
    request.webhook_url = Some("https://pipeline.example/webhook".to_string());

    let job = match scheduler.run(&request).await.unwrap() {
        PipelineOutcome::AwaitingWebhook { job, .. } => job,
        other => panic!("expected a parked job, got {other:?}"),
    };

    let server = Arc::new(
        WebhookServer::new(SECRET, dir.path().join("interim"))
            .unwrap()
            .with_store(scheduler.store()),
    );
    let body = serde_json::to_vec(&json!({
        "job_id": job.job_id,
        "status": "succeeded",
        "output": { "diarization": [ { "start": 0.0, "end": 2.0, "speaker": "S0" } ] }
    }))
    .unwrap();

    // Signature computed over a different body
    let signature = sign(SECRET, "1724000000", b"some other body");
    let (status, _) = server.process(Some("1724000000"), Some(&signature), None, None, &body);
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(server.metrics().failed_verifications(), 1);

    // The pipeline is still parked on the same job
    match scheduler.run(&request).await.unwrap() {
        PipelineOutcome::AwaitingWebhook { job: parked, .. } => {
            assert_eq!(parked.job_id, job.job_id);
        }
        other => panic!("expected the job to stay parked, got {other:?}"),
    }
}
