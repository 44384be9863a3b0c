//! Media upload to the diarization provider's temporary storage.
//!
//! The provider issues a short-lived signed URL for a tenant-scoped virtual
//! path; we stream the normalized WAV there and use the virtual path as the
//! media reference in all later job submissions. Remote copies expire on
//! their own after 24-48 hours.

use crate::budget::{ApiProvider, RateBudget};
use crate::convert;
use crate::defaults;
use crate::error::{Result, ScrivanoError};
use crate::retry::{self, RetryExecutor};
use crate::types::MediaHandle;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Anything that can turn a local WAV into a provider media reference.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, wav: &Path) -> Result<MediaHandle>;
}

/// Maps a file extension to a MIME type, the fallback when content
/// sniffing matches no known signature.
fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "mp4" => Some("video/mp4"),
        "avi" => Some("video/x-msvideo"),
        "mov" => Some("video/quicktime"),
        "m4a" => Some("audio/x-m4a"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}

/// MIME type detected from the file's leading bytes.
///
/// Independent of the extension; returns None when the content matches no
/// known signature.
fn sniff_mime(path: &Path) -> Option<&'static str> {
    infer::get_from_path(path)
        .ok()
        .flatten()
        .map(|kind| kind.mime_type())
}

/// Validates a local media file before any remote work is spent on it.
///
/// Checks existence, size bounds, extension, content-sniffed MIME type and
/// (for WAV) duration. Violations fail fast as fatal validation errors.
pub fn validate_input(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| ScrivanoError::Validation {
        message: format!("input file not found: {}", path.display()),
    })?;

    if !meta.is_file() {
        return Err(ScrivanoError::Validation {
            message: format!("{} is not a regular file", path.display()),
        });
    }

    if meta.len() < defaults::MIN_INPUT_BYTES {
        return Err(ScrivanoError::Validation {
            message: format!(
                "{} is {} bytes; minimum is {} bytes",
                path.display(),
                meta.len(),
                defaults::MIN_INPUT_BYTES
            ),
        });
    }

    if meta.len() > defaults::MAX_INPUT_BYTES {
        return Err(ScrivanoError::Validation {
            message: format!(
                "{} is {:.1} MB; maximum is {} MB",
                path.display(),
                meta.len() as f64 / (1024.0 * 1024.0),
                defaults::MAX_INPUT_BYTES / (1024 * 1024)
            ),
        });
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if !defaults::SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ScrivanoError::Validation {
            message: format!(
                "unsupported extension .{ext}; expected one of {:?}",
                defaults::SUPPORTED_EXTENSIONS
            ),
        });
    }

    // The MIME check sniffs the actual content so a renamed file cannot
    // smuggle an unsupported format past the extension check. Extension
    // guessing only covers content with no recognizable signature.
    let mime = match sniff_mime(path) {
        Some(mime) => mime,
        None => mime_for_extension(&ext).ok_or_else(|| ScrivanoError::Validation {
            message: format!("no MIME type known for .{ext}"),
        })?,
    };
    if !defaults::SUPPORTED_MIME_TYPES.contains(&mime) {
        return Err(ScrivanoError::Validation {
            message: format!("unsupported MIME type {mime} for {}", path.display()),
        });
    }

    if ext == "wav" {
        let duration = convert::wav_duration_seconds(path)?;
        if duration > defaults::MAX_INPUT_SECONDS {
            return Err(ScrivanoError::Validation {
                message: format!(
                    "{} is {:.1} h long; maximum is 24 h",
                    path.display(),
                    duration / 3600.0
                ),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    /// Short-lived signed URL to PUT the file body to.
    url: String,
    /// Virtual path usable in job submissions; falls back to what we sent.
    #[serde(default)]
    media_url: Option<String>,
}

/// Uploads normalized audio into the diarization provider's media storage.
pub struct MediaUploader {
    http: reqwest::Client,
    base_url: String,
    token: String,
    budget: Arc<RateBudget>,
    retry: Arc<RetryExecutor>,
}

impl MediaUploader {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        budget: Arc<RateBudget>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            budget,
            retry,
        }
    }

    /// Tenant-unique virtual path for one upload.
    fn virtual_path() -> String {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        format!("media://example/conversation-{}.wav", &unique[..8])
    }

    async fn create_presigned_url(&self, virtual_path: &str) -> Result<PresignResponse> {
        self.retry
            .run(ApiProvider::Diarization, "create_upload_url", || async {
                let _ticket = self.budget.acquire(ApiProvider::Diarization).await;
                let response = self
                    .http
                    .post(format!("{}/media/input", self.base_url))
                    .bearer_auth(&self.token)
                    .timeout(retry::default_call_timeout())
                    .json(&serde_json::json!({ "url": virtual_path }))
                    .send()
                    .await
                    .map_err(|e| ScrivanoError::from_transport("diarization", e))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ScrivanoError::from_status("diarization", status.as_u16(), body));
                }

                response
                    .json::<PresignResponse>()
                    .await
                    .map_err(|e| ScrivanoError::Schema {
                        message: format!("presign response: {e}"),
                    })
            })
            .await
    }

    async fn put_file(&self, presigned_url: &str, wav: &Path) -> Result<()> {
        self.retry
            .run(ApiProvider::Diarization, "upload_media", || async {
                let body = tokio::fs::read(wav).await?;
                let response = self
                    .http
                    .put(presigned_url)
                    .timeout(retry::transcription_timeout(body.len() as u64))
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| ScrivanoError::from_transport("diarization", e))?;

                let status = response.status();
                if status.is_server_error() {
                    // Signed-URL PUTs are safe to repeat; any 5xx retries fast
                    return Err(ScrivanoError::TransientNetwork {
                        message: format!("media upload returned {status}"),
                    });
                }
                if !status.is_success() {
                    return Err(ScrivanoError::Validation {
                        message: format!("media upload rejected with {status}"),
                    });
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl MediaStore for MediaUploader {
    async fn upload(&self, wav: &Path) -> Result<MediaHandle> {
        validate_input(wav)?;

        let virtual_path = Self::virtual_path();
        tracing::info!(file = %wav.display(), %virtual_path, "uploading media");

        let presign = self.create_presigned_url(&virtual_path).await?;
        self.put_file(&presign.url, wav).await?;

        let handle = MediaHandle(presign.media_url.unwrap_or(virtual_path));
        tracing::info!(%handle, "media uploaded; remote copy expires in 24-48h");
        Ok(handle)
    }
}

/// Mock media store for tests; hands out fake virtual paths.
pub struct MockMediaStore {
    should_fail: bool,
    uploads: std::sync::atomic::AtomicU32,
}

impl MockMediaStore {
    pub fn new() -> Self {
        Self {
            should_fail: false,
            uploads: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn uploads(&self) -> u32 {
        self.uploads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockMediaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaStore for MockMediaStore {
    async fn upload(&self, wav: &Path) -> Result<MediaHandle> {
        validate_input(wav)?;
        if self.should_fail {
            return Err(ScrivanoError::TransientNetwork {
                message: "mock upload failure".to_string(),
            });
        }
        self.uploads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(MediaHandle(format!(
            "media://example/mock-{}.wav",
            uuid::Uuid::new_v4().simple()
        )))
    }
}
