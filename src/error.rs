//! Error types for scrivano.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScrivanoError {
    // Input validation errors
    #[error("Input validation failed: {message}")]
    Validation { message: String },

    // Provider errors
    #[error("Provider {provider} rejected credentials")]
    Auth { provider: String },

    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("Transient network failure: {message}")]
    TransientNetwork { message: String },

    #[error("Provider {provider} returned status {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Provider response did not match expected schema: {message}")]
    Schema { message: String },

    // Pipeline errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Pipeline {pipeline_id} is already running")]
    AlreadyRunning { pipeline_id: String },

    #[error("Stage {stage} failed after {attempts} attempt(s): {source}")]
    Stage {
        stage: String,
        attempts: u32,
        #[source]
        source: Box<ScrivanoError>,
    },

    #[error("Internal invariant violated: {message}")]
    Internal { message: String },

    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O and serialization errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Retry class of an error, switched on by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Quota exhaustion; exponential backoff with jitter.
    RateLimited,
    /// Connection reset, timeout, DNS failure, 502/503/504; fast retry.
    TransientNetwork,
    /// Remaining retryable provider and I/O failures; moderate backoff.
    Other,
    /// Not worth retrying: bad credentials, invalid input, schema mismatch.
    Fatal,
}

impl ErrorClass {
    /// Short label used in statistics and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::TransientNetwork => "transient_network",
            Self::Other => "other",
            Self::Fatal => "fatal",
        }
    }
}

impl ScrivanoError {
    /// Classifies this error for the retry executor.
    ///
    /// HTTP 400 on an unchanged request cannot succeed on retry and is fatal;
    /// the remaining 4xx/5xx statuses not mapped to a dedicated variant are
    /// retried with moderate backoff.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::TransientNetwork { .. } => ErrorClass::TransientNetwork,
            Self::Provider { status: 400, .. } => ErrorClass::Fatal,
            Self::Provider { .. } | Self::Io(_) => ErrorClass::Other,
            Self::Validation { .. }
            | Self::Auth { .. }
            | Self::Schema { .. }
            | Self::Cancelled
            | Self::AlreadyRunning { .. }
            | Self::Stage { .. }
            | Self::Internal { .. }
            | Self::ConfigInvalidValue { .. }
            | Self::Config(_)
            | Self::Json(_) => ErrorClass::Fatal,
        }
    }

    /// Maps an HTTP status from a provider response to an error.
    pub fn from_status(provider: &str, status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Auth {
                provider: provider.to_string(),
            },
            429 => Self::RateLimited {
                provider: provider.to_string(),
            },
            502 | 503 | 504 => Self::TransientNetwork {
                message: format!("{provider} returned {status}"),
            },
            _ => Self::Provider {
                provider: provider.to_string(),
                status,
                message: message.into(),
            },
        }
    }

    /// Maps a transport-level reqwest failure to an error.
    ///
    /// Timeouts and connection failures are transient; anything that made it
    /// to a status line goes through [`Self::from_status`] instead.
    pub fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::TransientNetwork {
                message: format!("{provider}: {err}"),
            }
        } else if err.is_decode() {
            Self::Schema {
                message: format!("{provider}: {err}"),
            }
        } else {
            Self::Provider {
                provider: provider.to_string(),
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: err.to_string(),
            }
        }
    }

    /// Wraps this error with the stage that surfaced it.
    pub fn into_stage(self, stage: &str, attempts: u32) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            attempts,
            source: Box::new(self),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScrivanoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_rate_limited_display() {
        let error = ScrivanoError::RateLimited {
            provider: "diarization".to_string(),
        };
        assert_eq!(error.to_string(), "Rate limited by diarization");
    }

    #[test]
    fn test_provider_display() {
        let error = ScrivanoError::Provider {
            provider: "transcription".to_string(),
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Provider transcription returned status 500: boom"
        );
    }

    #[test]
    fn test_status_429_classifies_as_rate_limited() {
        let error = ScrivanoError::from_status("diarization", 429, "");
        assert_eq!(error.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn test_status_5xx_gateway_classifies_as_transient() {
        for status in [502, 503, 504] {
            let error = ScrivanoError::from_status("diarization", status, "");
            assert_eq!(error.class(), ErrorClass::TransientNetwork);
        }
    }

    #[test]
    fn test_status_auth_is_fatal() {
        for status in [401, 403] {
            let error = ScrivanoError::from_status("diarization", status, "");
            assert!(matches!(error, ScrivanoError::Auth { .. }));
            assert_eq!(error.class(), ErrorClass::Fatal);
        }
    }

    #[test]
    fn test_status_400_is_fatal() {
        let error = ScrivanoError::from_status("diarization", 400, "bad request");
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_status_other_4xx_retries_moderately() {
        let error = ScrivanoError::from_status("diarization", 404, "not found");
        assert_eq!(error.class(), ErrorClass::Other);
    }

    #[test]
    fn test_plain_500_retries_moderately() {
        let error = ScrivanoError::from_status("transcription", 500, "oops");
        assert_eq!(error.class(), ErrorClass::Other);
    }

    #[test]
    fn test_schema_error_is_fatal() {
        let error = ScrivanoError::Schema {
            message: "missing field".to_string(),
        };
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_cancelled_is_fatal() {
        assert_eq!(ScrivanoError::Cancelled.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_io_error_retries_moderately() {
        let error: ScrivanoError =
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert_eq!(error.class(), ErrorClass::Other);
    }

    #[test]
    fn test_stage_wrapper_preserves_source() {
        let inner = ScrivanoError::RateLimited {
            provider: "diarization".to_string(),
        };
        let wrapped = inner.into_stage("diarize", 8);
        assert!(wrapped.to_string().contains("diarize"));
        assert!(wrapped.to_string().contains("8 attempt"));

        let error_trait: &dyn std::error::Error = &wrapped;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScrivanoError>();
        assert_sync::<ScrivanoError>();
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(ErrorClass::RateLimited.label(), "rate_limited");
        assert_eq!(ErrorClass::TransientNetwork.label(), "transient_network");
        assert_eq!(ErrorClass::Other.label(), "other");
        assert_eq!(ErrorClass::Fatal.label(), "fatal");
    }
}
