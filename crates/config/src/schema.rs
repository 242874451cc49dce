use rendergate_types::GenError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// A single API key entry with an optional human-readable label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Generation provider endpoint and model selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Base URL of the Generative Language REST API.
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub hd_image_model: String,
    pub video_model: String,
    /// Delay between polls of a long-running video operation.
    pub video_poll_interval_ms: u64,
    /// Maximum number of polls before the video operation is abandoned.
    pub video_poll_limit: u32,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            hd_image_model: "gemini-3-pro-image-preview".to_string(),
            video_model: "veo-3.1-fast-generate-preview".to_string(),
            video_poll_interval_ms: 10_000,
            video_poll_limit: 60,
            timeout_secs: 300,
        }
    }
}

/// Key pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Keys seeded into the pool at startup.
    pub keys: Vec<ApiKeyEntry>,
    /// `SQLite` file shared by every process; in-memory pool when unset.
    pub database: Option<PathBuf>,
    /// How long an exhausted key stays out of rotation.
    pub cooldown_secs: u64,
    /// Dedicated key tried once when a pool key is rejected for billing.
    pub fallback_key: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            database: None,
            cooldown_secs: 300,
            fallback_key: None,
        }
    }
}

/// Which counter a backoff rule grows with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Growth {
    /// `base * factor^consecutive_quota_failures`
    Consecutive,
    /// `base * factor^attempts_made`
    Attempts,
    /// Always `base`.
    Flat,
}

/// One row of the retry policy table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffRuleConfig {
    pub base_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Upper bound applied after jitter.
    pub cap_ms: u64,
    /// Uniform random addition in `[0, jitter_ms]`.
    #[serde(default)]
    pub jitter_ms: u64,
    pub growth: Growth,
    /// Whether hitting this rule resets the consecutive quota counter.
    #[serde(default)]
    pub resets_quota: bool,
}

fn default_factor() -> f64 {
    1.0
}

impl BackoffRuleConfig {
    fn flat(ms: u64, resets_quota: bool) -> Self {
        Self {
            base_ms: ms,
            factor: 1.0,
            cap_ms: ms,
            jitter_ms: 0,
            growth: Growth::Flat,
            resets_quota,
        }
    }
}

/// Retry orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Optional wall-clock bound, checked before each retry sleep.
    pub deadline_secs: Option<u64>,
    pub quota: BackoffRuleConfig,
    pub overload: BackoffRuleConfig,
    pub transient: BackoffRuleConfig,
    pub pool_exhausted: BackoffRuleConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            deadline_secs: None,
            quota: BackoffRuleConfig {
                base_ms: 2_000,
                factor: 1.5,
                cap_ms: 20_000,
                jitter_ms: 1_000,
                growth: Growth::Consecutive,
                resets_quota: false,
            },
            overload: BackoffRuleConfig {
                base_ms: 2_000,
                factor: 1.5,
                cap_ms: 15_000,
                jitter_ms: 0,
                growth: Growth::Attempts,
                resets_quota: true,
            },
            transient: BackoffRuleConfig::flat(1_000, true),
            pool_exhausted: BackoffRuleConfig::flat(3_000, false),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
    /// Optional log file, rotated daily.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSettings,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration from a file path, merged with defaults and then
    /// with `RENDERGATE_`-prefixed environment variables (`__` separates
    /// nested keys, e.g. `RENDERGATE_RETRY__MAX_ATTEMPTS=5`).
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: &std::path::Path) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("RENDERGATE_").split("__"))
            .extract()
    }

    /// Defaults merged with environment overrides only.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if an override cannot be extracted.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Serialized},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("RENDERGATE_").split("__"))
            .extract()
    }

    /// Checks values serde cannot express constraints for.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), GenError> {
        if self.retry.max_attempts == 0 {
            return Err(GenError::Config("retry.max_attempts must be at least 1".into()));
        }
        let rules = [
            ("quota", &self.retry.quota),
            ("overload", &self.retry.overload),
            ("transient", &self.retry.transient),
            ("pool_exhausted", &self.retry.pool_exhausted),
        ];
        for (name, rule) in rules {
            if !rule.factor.is_finite() || rule.factor < 1.0 {
                return Err(GenError::Config(format!(
                    "retry.{name}.factor must be a finite number >= 1.0"
                )));
            }
            if rule.cap_ms < rule.base_ms {
                return Err(GenError::Config(format!(
                    "retry.{name}.cap_ms must not be below base_ms"
                )));
            }
        }
        if self.provider.video_poll_limit == 0 {
            return Err(GenError::Config(
                "provider.video_poll_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
