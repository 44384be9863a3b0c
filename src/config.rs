use crate::defaults;
use crate::error::{Result, ScrivanoError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub limits: LimitsConfig,
    pub paths: PathsConfig,
    pub webhook: WebhookConfig,
    pub retention: RetentionConfig,
}

/// Remote provider endpoints and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub diarization: EndpointConfig,
    pub transcription: TranscriptionConfig,
    pub combined: CombinedConfig,
}

/// Base URL plus bearer token for one provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Bearer token; usually injected via environment, not the config file.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_token: String,
}

/// Transcription provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_token: String,
    pub model: String,
    pub language: Option<String>,
}

/// Combined diarization+transcription provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CombinedConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_token: String,
    /// Provider-side model version identifier for prediction submission.
    pub model_version: String,
}

/// Rate limits and parallelism knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub diarization_rpm: usize,
    pub transcription_rpm: usize,
    pub combined_rpm: usize,
    pub max_concurrent_chunks: usize,
}

/// Filesystem layout under the data root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_root: PathBuf,
}

/// Webhook endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    /// HMAC secret; usually injected via environment, not the config file.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

/// Checkpoint retention policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Checkpoints older than this require an explicit resume request.
    pub auto_resume_hours: i64,
    /// Pipeline states idle longer than this are purged.
    pub purge_hours: i64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.pyannote.ai/v1".to_string(),
            api_token: String::new(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_token: String::new(),
            model: defaults::DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            language: None,
        }
    }
}

impl Default for CombinedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.replicate.com/v1".to_string(),
            api_token: String::new(),
            model_version: "thomasmol/whisper-diarization".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            diarization_rpm: defaults::DIARIZATION_RATE_LIMIT,
            transcription_rpm: defaults::TRANSCRIPTION_RATE_LIMIT,
            combined_rpm: defaults::COMBINED_RATE_LIMIT,
            max_concurrent_chunks: defaults::MAX_CONCURRENT_CHUNKS,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(defaults::DATA_ROOT),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: defaults::WEBHOOK_HOST.to_string(),
            port: defaults::WEBHOOK_PORT,
            secret: String::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            auto_resume_hours: defaults::AUTO_RESUME_MAX_AGE_HOURS,
            purge_hours: defaults::RETENTION_HOURS,
        }
    }
}

impl PathsConfig {
    /// Directory holding intermediate stage outputs.
    pub fn interim_dir(&self) -> PathBuf {
        self.data_root.join("interim")
    }

    /// Directory holding pipeline state files.
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_root.join("checkpoints")
    }

    /// Directory for final exported transcripts.
    pub fn processed_dir(&self) -> PathBuf {
        self.data_root.join("processed")
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SCRIVANO_DIARIZATION_TOKEN → providers.diarization.api_token
    /// - SCRIVANO_TRANSCRIPTION_TOKEN → providers.transcription.api_token
    /// - SCRIVANO_COMBINED_TOKEN → providers.combined.api_token
    /// - SCRIVANO_WEBHOOK_SECRET → webhook.secret
    /// - SCRIVANO_DATA_ROOT → paths.data_root
    /// - SCRIVANO_RETENTION_HOURS → retention.purge_hours
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("SCRIVANO_DIARIZATION_TOKEN")
            && !token.is_empty()
        {
            self.providers.diarization.api_token = token;
        }

        if let Ok(token) = std::env::var("SCRIVANO_TRANSCRIPTION_TOKEN")
            && !token.is_empty()
        {
            self.providers.transcription.api_token = token;
        }

        if let Ok(token) = std::env::var("SCRIVANO_COMBINED_TOKEN")
            && !token.is_empty()
        {
            self.providers.combined.api_token = token;
        }

        if let Ok(secret) = std::env::var("SCRIVANO_WEBHOOK_SECRET")
            && !secret.is_empty()
        {
            self.webhook.secret = secret;
        }

        if let Ok(root) = std::env::var("SCRIVANO_DATA_ROOT")
            && !root.is_empty()
        {
            self.paths.data_root = PathBuf::from(root);
        }

        if let Ok(hours) = std::env::var("SCRIVANO_RETENTION_HOURS")
            && let Ok(hours) = hours.parse::<i64>()
        {
            self.retention.purge_hours = hours;
        }

        self
    }

    /// Validate values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<()> {
        if self.limits.diarization_rpm == 0
            || self.limits.transcription_rpm == 0
            || self.limits.combined_rpm == 0
        {
            return Err(ScrivanoError::ConfigInvalidValue {
                key: "limits".to_string(),
                message: "rate limits must be positive".to_string(),
            });
        }
        if self.limits.max_concurrent_chunks == 0 {
            return Err(ScrivanoError::ConfigInvalidValue {
                key: "limits.max_concurrent_chunks".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.retention.auto_resume_hours <= 0 || self.retention.purge_hours <= 0 {
            return Err(ScrivanoError::ConfigInvalidValue {
                key: "retention".to_string(),
                message: "retention windows must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Canonical JSON rendering used in the pipeline fingerprint.
    ///
    /// Struct field order is fixed, so the same config always canonicalizes
    /// to the same bytes. Secrets are included so that a credential change
    /// starts a fresh pipeline rather than resuming with stale remote state.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("config serialization cannot fail")
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/scrivano/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .expect("Could not determine config directory")
            .join("scrivano")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_scrivano_env() {
        remove_env("SCRIVANO_DIARIZATION_TOKEN");
        remove_env("SCRIVANO_TRANSCRIPTION_TOKEN");
        remove_env("SCRIVANO_COMBINED_TOKEN");
        remove_env("SCRIVANO_WEBHOOK_SECRET");
        remove_env("SCRIVANO_DATA_ROOT");
        remove_env("SCRIVANO_RETENTION_HOURS");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.limits.diarization_rpm, 20);
        assert_eq!(config.limits.transcription_rpm, 50);
        assert_eq!(config.limits.combined_rpm, 100);
        assert_eq!(config.limits.max_concurrent_chunks, 3);

        assert_eq!(config.providers.transcription.model, "whisper-1");
        assert_eq!(config.webhook.host, "0.0.0.0");
        assert_eq!(config.webhook.port, 8000);

        assert_eq!(config.retention.auto_resume_hours, 24);
        assert_eq!(config.retention.purge_hours, 48);

        assert_eq!(config.paths.data_root, PathBuf::from("data"));
    }

    #[test]
    fn test_paths_layout() {
        let paths = PathsConfig {
            data_root: PathBuf::from("/var/lib/scrivano"),
        };
        assert_eq!(paths.interim_dir(), PathBuf::from("/var/lib/scrivano/interim"));
        assert_eq!(
            paths.checkpoints_dir(),
            PathBuf::from("/var/lib/scrivano/checkpoints")
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [providers.transcription]
            base_url = "http://localhost:8080/v1"
            model = "gpt-4o-transcribe"
            language = "de"

            [limits]
            diarization_rpm = 5
            max_concurrent_chunks = 2

            [webhook]
            port = 9000

            [retention]
            purge_hours = 12
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.providers.transcription.base_url, "http://localhost:8080/v1");
        assert_eq!(config.providers.transcription.model, "gpt-4o-transcribe");
        assert_eq!(config.providers.transcription.language, Some("de".to_string()));
        assert_eq!(config.limits.diarization_rpm, 5);
        assert_eq!(config.limits.max_concurrent_chunks, 2);
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.retention.purge_hours, 12);

        // Untouched sections keep defaults
        assert_eq!(config.limits.transcription_rpm, 50);
        assert_eq!(config.webhook.host, "0.0.0.0");
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scrivano_env();

        set_env("SCRIVANO_DIARIZATION_TOKEN", "dia-token");
        set_env("SCRIVANO_WEBHOOK_SECRET", "hook-secret-0123456789");
        set_env("SCRIVANO_DATA_ROOT", "/tmp/scrivano-data");
        set_env("SCRIVANO_RETENTION_HOURS", "96");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.providers.diarization.api_token, "dia-token");
        assert_eq!(config.webhook.secret, "hook-secret-0123456789");
        assert_eq!(config.paths.data_root, PathBuf::from("/tmp/scrivano-data"));
        assert_eq!(config.retention.purge_hours, 96);
        // Not overridden
        assert!(config.providers.transcription.api_token.is_empty());

        clear_scrivano_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scrivano_env();

        set_env("SCRIVANO_DIARIZATION_TOKEN", "");
        let config = Config::default().with_env_overrides();
        assert!(config.providers.diarization.api_token.is_empty());

        clear_scrivano_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [limits
            diarization_rpm = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_scrivano_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_zero_rate_limit() {
        let mut config = Config::default();
        config.limits.transcription_rpm = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.limits.max_concurrent_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nonpositive_retention() {
        let mut config = Config::default();
        config.retention.purge_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_canonical_is_deterministic() {
        let a = Config::default().canonical();
        let b = Config::default().canonical();
        assert_eq!(a, b);

        let mut changed = Config::default();
        changed.limits.diarization_rpm = 7;
        assert_ne!(a, changed.canonical());
    }
}
