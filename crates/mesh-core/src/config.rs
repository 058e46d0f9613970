//! Configuration for the mesh reconciler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of buckets processed concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default deadline for one bucket's pipeline in milliseconds.
pub const DEFAULT_BUCKET_TIMEOUT_MS: u64 = 120_000;

/// Default number of attempts for a retryable backend call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first retry delay in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;

/// Default retry delay ceiling in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Region used for bucket lookups that are not tied to a declared region.
pub const DEFAULT_LOCATE_REGION: &str = "us-east-1";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Reconciler configuration.
    pub reconciler: ReconcilerConfig,
    /// Retry policy for backend calls.
    pub retry: RetryConfig,
    /// Storage backend client configuration.
    pub backend: BackendConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate().map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.reconciler.validate()?;
        self.retry.validate()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    Pretty,
    /// JSON format, one object per line.
    #[default]
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Json }
    }
}

/// What to do when a mesh bucket does not have versioning enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersioningPolicy {
    /// Enable versioning, then continue.
    #[default]
    Remediate,
    /// Fail the bucket without touching it.
    Fail,
}

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Upper bound on buckets processed at once.
    pub max_concurrency: usize,
    /// Deadline for one bucket's read-diff-apply pipeline in milliseconds.
    pub bucket_timeout_ms: u64,
    /// Versioning precondition policy.
    pub versioning_policy: VersioningPolicy,
    /// On update, also look up buckets that the previous declaration
    /// dropped but that still carry this mesh's rules.
    pub discover_orphans: bool,
    /// Compute and report changes without writing anything.
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            bucket_timeout_ms: DEFAULT_BUCKET_TIMEOUT_MS,
            versioning_policy: VersioningPolicy::Remediate,
            discover_orphans: true,
            dry_run: false,
        }
    }
}

impl ReconcilerConfig {
    /// Creates a reconciler configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the per-bucket deadline.
    pub fn bucket_timeout(mut self, timeout: Duration) -> Self {
        self.bucket_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the versioning policy.
    pub fn versioning_policy(mut self, policy: VersioningPolicy) -> Self {
        self.versioning_policy = policy;
        self
    }

    /// Sets whether orphaned buckets are looked up on update.
    pub fn discover_orphans(mut self, enabled: bool) -> Self {
        self.discover_orphans = enabled;
        self
    }

    /// Sets dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Returns the per-bucket deadline as a Duration.
    pub fn bucket_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.bucket_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigValidationError::InvalidConcurrency);
        }
        if self.bucket_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidTimeout);
        }
        Ok(())
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Delay ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Creates a retry policy with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total attempt count.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Sets the delay ceiling.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let delay = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidMaxAttempts);
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigValidationError::InvalidBackoff);
        }
        Ok(())
    }
}

/// Storage backend client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Custom endpoint, for S3-compatible stores and local testing.
    pub endpoint_url: Option<String>,
    /// Use path-style addressing instead of virtual-hosted buckets.
    pub force_path_style: bool,
    /// Attempts made by the SDK itself before an error reaches the reconciler.
    pub sdk_max_attempts: u32,
    /// Region used for bucket location lookups.
    pub locate_region: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            force_path_style: false,
            sdk_max_attempts: 1,
            locate_region: DEFAULT_LOCATE_REGION.to_string(),
        }
    }
}

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// Concurrency must be at least 1.
    #[error("max concurrency must be at least 1")]
    InvalidConcurrency,

    /// Timeout must be positive.
    #[error("bucket timeout must be positive")]
    InvalidTimeout,

    /// At least one attempt is required.
    #[error("retry max attempts must be at least 1")]
    InvalidMaxAttempts,

    /// The first delay may not exceed the ceiling.
    #[error("initial backoff must not exceed max backoff")]
    InvalidBackoff,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.reconciler.max_concurrency, 8);
        assert_eq!(config.reconciler.versioning_policy, VersioningPolicy::Remediate);
        assert!(config.reconciler.discover_orphans);
        assert!(!config.reconciler.dry_run);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.backend.sdk_max_attempts, 1);
        assert_eq!(config.backend.locate_region, "us-east-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[logging]
level = "debug"
format = "pretty"

[reconciler]
max_concurrency = 2
versioning_policy = "fail"
dry_run = true

[retry]
max_attempts = 3

[backend]
endpoint_url = "http://localhost:9000"
force_path_style = true
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.reconciler.max_concurrency, 2);
        assert_eq!(config.reconciler.versioning_policy, VersioningPolicy::Fail);
        assert!(config.reconciler.dry_run);
        assert_eq!(config.reconciler.bucket_timeout_ms, DEFAULT_BUCKET_TIMEOUT_MS);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, DEFAULT_INITIAL_BACKOFF_MS);
        assert_eq!(config.backend.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert!(config.backend.force_path_style);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        assert!(Config::parse("[reconciler]\nmax_concurrency = 0\n").is_err());
        assert!(Config::parse("[retry]\nmax_attempts = 0\n").is_err());
        assert!(Config::parse("[logging]\nformat = \"xml\"\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "[reconciler]\nmax_concurrency = 4\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.reconciler.max_concurrency, 4);
        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_reconciler_builder() {
        let config = ReconcilerConfig::new()
            .max_concurrency(3)
            .bucket_timeout(Duration::from_secs(5))
            .versioning_policy(VersioningPolicy::Fail)
            .discover_orphans(false)
            .dry_run(true);

        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.bucket_timeout_duration(), Duration::from_secs(5));
        assert_eq!(config.versioning_policy, VersioningPolicy::Fail);
        assert!(!config.discover_orphans);
        assert!(config.dry_run);
    }

    #[test]
    fn test_reconciler_validation() {
        assert_eq!(
            ReconcilerConfig::new().max_concurrency(0).validate(),
            Err(ConfigValidationError::InvalidConcurrency)
        );
        assert_eq!(
            ReconcilerConfig::new().bucket_timeout(Duration::ZERO).validate(),
            Err(ConfigValidationError::InvalidTimeout)
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::new()
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(1_000));

        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_for_attempt(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_validation() {
        assert_eq!(
            RetryConfig::new().max_attempts(0).validate(),
            Err(ConfigValidationError::InvalidMaxAttempts)
        );
        let inverted = RetryConfig::new()
            .initial_backoff(Duration::from_secs(2))
            .max_backoff(Duration::from_secs(1));
        assert_eq!(inverted.validate(), Err(ConfigValidationError::InvalidBackoff));
    }
}
