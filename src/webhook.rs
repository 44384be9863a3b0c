//! Webhook endpoint for asynchronous provider callbacks.
//!
//! Verifies the `v0:{timestamp}:{body}` HMAC-SHA256 signature in constant
//! time, persists every valid payload (including failed and canceled jobs),
//! routes on payload shape, and notifies listeners so parked pipeline
//! stages can complete.

use crate::checkpoint::CheckpointStore;
use crate::error::{Result, ScrivanoError};
use crate::scheduler::complete_pending_job;
use crate::types::WebhookEvent;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

type HmacSha256 = Hmac<Sha256>;

/// Computes the hex signature for a webhook delivery.
///
/// Exposed so tests and local tooling can sign synthetic events.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a received signature in constant time.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Job family, detected from the payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Diarization,
    Identification,
    Voiceprint,
    Unknown,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Diarization => "diarization",
            Self::Identification => "identification",
            Self::Voiceprint => "voiceprint",
            Self::Unknown => "unknown",
        }
    }
}

/// Routes an event on the shape of its output payload.
pub fn detect_event_kind(output: Option<&Value>) -> EventKind {
    let Some(output) = output else {
        return EventKind::Unknown;
    };
    if output.get("diarization").is_some() {
        EventKind::Diarization
    } else if output.get("identification").is_some() {
        EventKind::Identification
    } else if output.get("voiceprint").is_some() {
        EventKind::Voiceprint
    } else {
        EventKind::Unknown
    }
}

/// Endpoint counters, exposed at `GET /metrics`.
#[derive(Debug, Default)]
pub struct WebhookMetrics {
    processed_webhooks: AtomicU64,
    failed_verifications: AtomicU64,
    successful_events: AtomicU64,
}

impl WebhookMetrics {
    pub fn processed(&self) -> u64 {
        self.processed_webhooks.load(Ordering::Relaxed)
    }

    pub fn failed_verifications(&self) -> u64 {
        self.failed_verifications.load(Ordering::Relaxed)
    }

    pub fn successful_events(&self) -> u64 {
        self.successful_events.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Value {
        let processed = self.processed();
        let failed = self.failed_verifications();
        let rate = if processed == 0 {
            100.0
        } else {
            (processed - failed) as f64 / processed as f64 * 100.0
        };
        json!({
            "processed_webhooks": processed,
            "failed_verifications": failed,
            "successful_events": self.successful_events(),
            "verification_success_rate": rate,
        })
    }
}

/// Shared state behind the endpoint handlers.
pub struct WebhookServer {
    secret: String,
    interim_dir: PathBuf,
    metrics: WebhookMetrics,
    notify: broadcast::Sender<WebhookEvent>,
    /// When wired, matching pending pipeline stages complete on delivery.
    store: Option<Arc<CheckpointStore>>,
}

impl WebhookServer {
    pub fn new(secret: impl Into<String>, interim_dir: PathBuf) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < 10 {
            return Err(ScrivanoError::ConfigInvalidValue {
                key: "webhook.secret".to_string(),
                message: "must be at least 10 characters".to_string(),
            });
        }
        std::fs::create_dir_all(&interim_dir)?;
        let (notify, _) = broadcast::channel(64);
        Ok(Self {
            secret,
            interim_dir,
            metrics: WebhookMetrics::default(),
            notify,
            store: None,
        })
    }

    /// Wires the checkpoint store so parked stages resume on delivery.
    pub fn with_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(&self) -> &WebhookMetrics {
        &self.metrics
    }

    /// Live feed of accepted events.
    pub fn subscribe(&self) -> broadcast::Receiver<WebhookEvent> {
        self.notify.subscribe()
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/webhook", post(handle_webhook))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .with_state(self)
    }

    /// Binds and serves until cancelled externally.
    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> Result<()> {
        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "webhook server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| ScrivanoError::Internal {
                message: format!("webhook server: {e}"),
            })
    }

    /// Persists an accepted event to the interim directory.
    ///
    /// The filename is stable per job so redeliveries overwrite the stored
    /// payload instead of accumulating duplicates.
    fn persist_event(&self, event: &WebhookEvent, kind: EventKind) -> Result<PathBuf> {
        let path = self
            .interim_dir
            .join(format!("webhook_{}_{}.json", event.job_id, kind.label()));
        let record = json!({
            "job_id": event.job_id,
            "job_type": kind.label(),
            "status": event.status,
            "received_at": chrono::Utc::now().to_rfc3339(),
            "output": event.output,
            "retry_info": event.retry_num.map(|n| json!({
                "retry_num": n,
                "retry_reason": event.retry_reason,
            })),
        });
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(path)
    }

    /// Verification, persistence and dispatch for one delivery.
    ///
    /// Returns the HTTP status and response body. The HTTP handler is a
    /// thin wrapper over this.
    pub fn process(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        retry_num: Option<u32>,
        retry_reason: Option<String>,
        body: &[u8],
    ) -> (StatusCode, Value) {
        self.metrics
            .processed_webhooks
            .fetch_add(1, Ordering::Relaxed);

        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            tracing::warn!("webhook missing signature headers");
            return (
                StatusCode::BAD_REQUEST,
                json!({ "error": "missing X-Request-Timestamp or X-Signature" }),
            );
        };

        if !verify_signature(&self.secret, timestamp, body, signature) {
            self.metrics
                .failed_verifications
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(timestamp, "webhook signature verification failed");
            return (
                StatusCode::FORBIDDEN,
                json!({ "error": "invalid signature" }),
            );
        }

        let mut event: WebhookEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "webhook body is not a valid event");
                return (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": format!("invalid payload: {e}") }),
                );
            }
        };
        event.retry_num = retry_num;
        event.retry_reason = retry_reason;

        if let Some(retry) = event.retry_num {
            tracing::info!(
                job_id = %event.job_id,
                retry,
                reason = event.retry_reason.as_deref().unwrap_or(""),
                "webhook redelivery"
            );
        }

        let kind = detect_event_kind(event.output.as_ref());
        if let Err(e) = self.persist_event(&event, kind) {
            tracing::error!(job_id = %event.job_id, error = %e, "failed to persist webhook payload");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "persistence failure" }),
            );
        }

        // Complete a parked pipeline stage, if any is waiting on this job
        if let Some(store) = &self.store {
            match complete_pending_job(store, &event) {
                Ok(Some(pipeline_id)) => {
                    tracing::info!(job_id = %event.job_id, %pipeline_id, "pending stage resolved");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %event.job_id, error = %e, "pending stage completion failed");
                }
            }
        }

        let _ = self.notify.send(event.clone());
        self.metrics
            .successful_events
            .fetch_add(1, Ordering::Relaxed);

        tracing::info!(job_id = %event.job_id, status = ?event.status, kind = kind.label(), "webhook accepted");
        (StatusCode::OK, json!({ "status": "ok" }))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_webhook(
    State(server): State<Arc<WebhookServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timestamp = header_str(&headers, "x-request-timestamp");
    let signature = header_str(&headers, "x-signature");
    let retry_num = header_str(&headers, "x-retry-num").and_then(|v| v.parse().ok());
    let retry_reason = header_str(&headers, "x-retry-reason").map(str::to_string);

    let (status, payload) = server.process(timestamp, signature, retry_num, retry_reason, &body);
    (status, Json(payload)).into_response()
}

async fn handle_health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn handle_metrics(State(server): State<Arc<WebhookServer>>) -> Response {
    (StatusCode::OK, Json(server.metrics.snapshot())).into_response()
}
