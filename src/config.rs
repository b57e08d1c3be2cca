use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{ErrorKind, ParallelConfig, RetryPolicy};
use crate::review::ReviewSettings;

/// Main configuration structure for the fraud review service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FraudReviewConfig {
    /// Where runs, ledgers and waiters are kept
    pub storage: StorageConfig,
    /// Routing thresholds and callback timeout
    pub review: ReviewConfig,
    /// Human verification fan-out
    pub verification: VerificationConfig,
    /// Retry policies per collaborator
    pub retry: RetryConfig,
    /// Scoring service
    pub scorer: ScorerConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the file system store
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReviewConfig {
    /// Scores below this are authorized directly
    pub low_threshold: i64,
    /// Scores at or above this are escalated directly
    pub high_threshold: i64,
    /// Score assumed when the scorer cannot be trusted
    pub max_escalation_score: i64,
    pub verification_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VerificationConfig {
    pub max_concurrency: usize,
    pub min_successful: usize,
    pub tolerated_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    pub scorer: RetrySettings,
    pub notifier: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl RetrySettings {
    /// Policy retrying connection and timeout failures.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::transient(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScorerConfig {
    /// Scoring endpoint; without one every transaction fails safe to escalation
    pub endpoint: Option<String>,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (overridden by RUST_LOG)
    pub log_level: String,
    /// Emit JSON lines instead of human readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl Default for FraudReviewConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Filesystem,
                directory: PathBuf::from(".fraud-review"),
            },
            review: ReviewConfig {
                low_threshold: 3,
                high_threshold: 5,
                max_escalation_score: 5,
                verification_timeout_seconds: 24 * 60 * 60, // 1 day
            },
            verification: VerificationConfig {
                max_concurrency: 2,
                min_successful: 1,
                tolerated_failures: 1,
            },
            retry: RetryConfig {
                scorer: RetrySettings::default(),
                notifier: RetrySettings::default(),
            },
            scorer: ScorerConfig {
                endpoint: None,
                request_timeout_seconds: 30,
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

impl FraudReviewConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (fraud-review.toml)
    /// 3. Environment variables (prefixed with FRAUD_REVIEW_, `__` between sections)
    pub fn load() -> Result<Self> {
        let default_file = Path::new("fraud-review.toml");
        Self::load_from(default_file.exists().then_some(default_file))
    }

    /// Same as `load`, reading an explicit configuration file instead.
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("FRAUD_REVIEW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: FraudReviewConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let review = &self.review;
        if review.low_threshold >= review.high_threshold {
            bail!(
                "review.low_threshold ({}) must be below review.high_threshold ({})",
                review.low_threshold,
                review.high_threshold
            );
        }
        if review.max_escalation_score < review.high_threshold {
            bail!("review.max_escalation_score must be at least review.high_threshold");
        }
        if review.verification_timeout_seconds == 0 {
            bail!("review.verification_timeout_seconds must be positive");
        }
        if self.verification.max_concurrency == 0 {
            bail!("verification.max_concurrency must be at least 1");
        }
        for (name, settings) in [("scorer", &self.retry.scorer), ("notifier", &self.retry.notifier)] {
            if settings.max_attempts == 0 {
                bail!("retry.{name}.max_attempts must be at least 1");
            }
            if settings.base_delay_ms > settings.max_delay_ms {
                bail!("retry.{name}.base_delay_ms exceeds retry.{name}.max_delay_ms");
            }
        }
        if self.scorer.request_timeout_seconds == 0 {
            bail!("scorer.request_timeout_seconds must be positive");
        }
        Ok(())
    }

    /// Workflow settings derived from this configuration.
    pub fn review_settings(&self) -> ReviewSettings {
        ReviewSettings {
            low_threshold: self.review.low_threshold,
            high_threshold: self.review.high_threshold,
            max_escalation_score: self.review.max_escalation_score,
            verification_timeout: Duration::from_secs(self.review.verification_timeout_seconds),
            verification: ParallelConfig::new(
                self.verification.min_successful,
                self.verification.tolerated_failures,
                self.verification.max_concurrency,
            ),
            // A response without a score is worth another attempt.
            scorer_retry: self.retry.scorer.policy().with_retryable(ErrorKind::MissingField),
            notifier_retry: self.retry.notifier.policy(),
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<FraudReviewConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = FraudReviewConfig::load_env_file();
        FraudReviewConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static FraudReviewConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
