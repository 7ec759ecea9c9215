//! Core configuration types and loading.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::defaults;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    pub database: Option<DatabaseConfig>,
    /// Campaign content and pricing policy.
    #[serde(default)]
    pub campaign: CampaignConfig,
    /// Verification scheduling and retry policy.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Channel gateway backend selection.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break the settlement policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.campaign.price_cap <= Decimal::ZERO {
            return Err(ConfigError::Invalid("campaign.price_cap must be positive".into()));
        }
        if self.campaign.min_text_len == 0 || self.campaign.min_text_len > self.campaign.max_text_len {
            return Err(ConfigError::Invalid(
                "campaign text length bounds must satisfy 0 < min <= max".into(),
            ));
        }
        if self.campaign.default_duration_hours <= 0 {
            return Err(ConfigError::Invalid(
                "campaign.default_duration_hours must be positive".into(),
            ));
        }
        if self.campaign.expiry_days <= 0 {
            return Err(ConfigError::Invalid("campaign.expiry_days must be positive".into()));
        }
        if self.verification.max_retries == 0 {
            return Err(ConfigError::Invalid("verification.max_retries must be at least 1".into()));
        }
        if self.verification.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "verification.max_concurrent_jobs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    pub path: String,
}

/// Campaign content and pricing policy.
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    /// Maximum campaign price.
    #[serde(default = "defaults::price_cap")]
    pub price_cap: Decimal,
    /// Minimum trimmed ad text length.
    #[serde(default = "defaults::min_text_len")]
    pub min_text_len: usize,
    /// Maximum trimmed ad text length.
    #[serde(default = "defaults::max_text_len")]
    pub max_text_len: usize,
    /// Maximum number of links in the ad text.
    #[serde(default = "defaults::max_links")]
    pub max_links: usize,
    /// Keywords that reject ad content outright (case-insensitive substring).
    #[serde(default = "defaults::denylist")]
    pub denylist: Vec<String>,
    /// Pinned duration applied when the advertiser leaves it unset, in hours.
    #[serde(default = "defaults::default_duration_hours")]
    pub default_duration_hours: i64,
    /// How long a campaign may sit unaccepted before the cleanup sweep
    /// cancels it, in days. Independent of the pinned duration.
    #[serde(default = "defaults::expiry_days")]
    pub expiry_days: i64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            price_cap: defaults::price_cap(),
            min_text_len: defaults::min_text_len(),
            max_text_len: defaults::max_text_len(),
            max_links: defaults::max_links(),
            denylist: defaults::denylist(),
            default_duration_hours: defaults::default_duration_hours(),
            expiry_days: defaults::expiry_days(),
        }
    }
}

/// Verification scheduling and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Total verification attempts before the campaign is forced to FAILED.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Base retry delay in seconds; retry `n` waits `n * retry_backoff_secs`.
    #[serde(default = "defaults::retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Interval of the overdue-verification sweep, in seconds.
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Interval of the expired-campaign cleanup sweep, in seconds.
    #[serde(default = "defaults::cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Grace window before a late-firing job is logged as a misfire.
    #[serde(default = "defaults::misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// Global bound on concurrently executing scheduler jobs.
    #[serde(default = "defaults::max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            retry_backoff_secs: defaults::retry_backoff_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            cleanup_interval_secs: defaults::cleanup_interval_secs(),
            misfire_grace_secs: defaults::misfire_grace_secs(),
            max_concurrent_jobs: defaults::max_concurrent_jobs(),
        }
    }
}

/// Channel gateway backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Backend name. Only "noop" ships with the daemon; a real messaging
    /// client registers itself under its own name.
    #[serde(default = "defaults::gateway_backend")]
    pub backend: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: defaults::gateway_backend(),
        }
    }
}
