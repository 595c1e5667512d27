//! Configuration management for star-watcher
//!
//! Settings live in `<config_dir>/star-watcher/config.toml`. Every section is
//! optional; missing keys fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::differ::DiffOptions;
use crate::retry::RetryPolicy;
use crate::source::MAX_PAGE_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GitHub API configuration
    pub api: ApiConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Incremental fetch and change detection
    pub incremental: IncrementalConfig,
    /// Retry and backoff
    pub retry: RetryConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// State file storage
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API base URL
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Repositories per page (1-100)
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Allow token from the GITHUB_TOKEN environment variable
    pub allow_env_token: bool,
    /// Where `auth login` keeps the token
    pub storage: TokenStorage,
    /// Token file used when `storage = "file"`
    pub token_path: PathBuf,
}

/// Backend for the stored token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorage {
    /// OS keychain / credential manager / kernel keyring
    #[default]
    Keyring,
    /// JSON file with owner-only permissions
    File,
}

impl std::fmt::Display for TokenStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStorage::Keyring => write!(f, "keyring"),
            TokenStorage::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for TokenStorage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "keyring" => Ok(TokenStorage::Keyring),
            "file" => Ok(TokenStorage::File),
            other => bail!("unknown token storage '{}' (expected keyring or file)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    /// Use incremental fetches between full syncs
    pub enabled: bool,
    /// Hours between forced full syncs
    pub full_sync_interval_hours: u32,
    /// Retry a failed incremental fetch as a full fetch
    pub fallback_on_error: bool,
    /// Upper bound on pages read by one incremental fetch
    pub max_incremental_pages: u32,
    /// Report repositories that were unstarred
    pub detect_unstars: bool,
    /// Report repositories that were starred again
    pub detect_restars: bool,
    /// Slack when comparing star timestamps, in seconds
    pub timestamp_tolerance_secs: u64,
    /// A starred_at move of at least this many seconds counts as a new star
    pub restar_threshold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Wait out rate limits instead of failing
    pub retry_on_rate_limit: bool,
    /// Extra wait after the reported rate-limit reset, in seconds
    pub rate_limit_buffer_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    /// text or json
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one state file per user
    pub state_dir: PathBuf,
    /// Copy the previous state file to `<file>.bak` before overwriting
    pub keep_backup: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            timeout_secs: 30,
            per_page: MAX_PAGE_SIZE,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_env_token: true,
            storage: TokenStorage::default(),
            token_path: config_dir().join("token.json"),
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full_sync_interval_hours: 24,
            fallback_on_error: true,
            max_incremental_pages: 10,
            detect_unstars: true,
            detect_restars: true,
            timestamp_tolerance_secs: 60,
            restar_threshold_secs: 600,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retry_on_rate_limit: true,
            rate_limit_buffer_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: home.join(".star-watcher"),
            keep_backup: true,
        }
    }
}

/// Upper bounds enforced by [`Config::validate`]
pub const MAX_TIMESTAMP_TOLERANCE_SECS: u64 = 86_400;
pub const MAX_RESTAR_THRESHOLD_SECS: u64 = 30 * 86_400;
pub const MAX_RETRIES: u32 = 100;
pub const MAX_RATE_LIMIT_BUFFER_SECS: u64 = 3_600;

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const LOG_FORMATS: &[&str] = &["text", "json"];

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("star-watcher")
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Load from `path` (or the default location). A missing file yields
    /// the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Reset out-of-range values to their defaults. Returns one message per
    /// adjustment.
    pub fn validate(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        let api = ApiConfig::default();
        let inc = IncrementalConfig::default();
        let retry = RetryConfig::default();
        let logging = LoggingConfig::default();

        if self.api.per_page == 0 || self.api.per_page > MAX_PAGE_SIZE {
            fixes.push(format!(
                "api.per_page {} out of range, using {}",
                self.api.per_page, api.per_page
            ));
            self.api.per_page = api.per_page;
        }
        if self.api.timeout_secs == 0 {
            fixes.push(format!("api.timeout_secs must be positive, using {}", api.timeout_secs));
            self.api.timeout_secs = api.timeout_secs;
        }
        if self.incremental.full_sync_interval_hours == 0 {
            fixes.push(format!(
                "incremental.full_sync_interval_hours must be positive, using {}",
                inc.full_sync_interval_hours
            ));
            self.incremental.full_sync_interval_hours = inc.full_sync_interval_hours;
        }
        if self.incremental.max_incremental_pages == 0 {
            fixes.push(format!(
                "incremental.max_incremental_pages must be positive, using {}",
                inc.max_incremental_pages
            ));
            self.incremental.max_incremental_pages = inc.max_incremental_pages;
        }
        if self.incremental.timestamp_tolerance_secs > MAX_TIMESTAMP_TOLERANCE_SECS {
            fixes.push(format!(
                "incremental.timestamp_tolerance_secs above {}, using {}",
                MAX_TIMESTAMP_TOLERANCE_SECS, inc.timestamp_tolerance_secs
            ));
            self.incremental.timestamp_tolerance_secs = inc.timestamp_tolerance_secs;
        }
        if self.incremental.restar_threshold_secs > MAX_RESTAR_THRESHOLD_SECS {
            fixes.push(format!(
                "incremental.restar_threshold_secs above {}, using {}",
                MAX_RESTAR_THRESHOLD_SECS, inc.restar_threshold_secs
            ));
            self.incremental.restar_threshold_secs = inc.restar_threshold_secs;
        }
        if self.retry.max_retries > MAX_RETRIES {
            fixes.push(format!(
                "retry.max_retries above {}, using {}",
                MAX_RETRIES, retry.max_retries
            ));
            self.retry.max_retries = retry.max_retries;
        }
        if self.retry.rate_limit_buffer_secs > MAX_RATE_LIMIT_BUFFER_SECS {
            fixes.push(format!(
                "retry.rate_limit_buffer_secs above {}, using {}",
                MAX_RATE_LIMIT_BUFFER_SECS, retry.rate_limit_buffer_secs
            ));
            self.retry.rate_limit_buffer_secs = retry.rate_limit_buffer_secs;
        }
        if self.retry.initial_delay_ms == 0 {
            fixes.push(format!(
                "retry.initial_delay_ms must be positive, using {}",
                retry.initial_delay_ms
            ));
            self.retry.initial_delay_ms = retry.initial_delay_ms;
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            fixes.push(format!(
                "retry.max_delay_ms below initial delay, using {}",
                retry.max_delay_ms.max(self.retry.initial_delay_ms)
            ));
            self.retry.max_delay_ms = retry.max_delay_ms.max(self.retry.initial_delay_ms);
        }
        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier > 1.0) {
            fixes.push(format!(
                "retry.backoff_multiplier must be greater than 1.0, using {}",
                retry.backoff_multiplier
            ));
            self.retry.backoff_multiplier = retry.backoff_multiplier;
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            fixes.push(format!(
                "unknown logging.level '{}', using {}",
                self.logging.level, logging.level
            ));
            self.logging.level = logging.level;
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            fixes.push(format!(
                "unknown logging.format '{}', using {}",
                self.logging.format, logging.format
            ));
            self.logging.format = logging.format;
        }

        fixes
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            retry_on_rate_limit: self.retry.retry_on_rate_limit,
            rate_limit_buffer: Duration::from_secs(self.retry.rate_limit_buffer_secs),
        }
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            detect_unstars: self.incremental.detect_unstars,
            detect_restars: self.incremental.detect_restars,
            restar_threshold: seconds(self.incremental.restar_threshold_secs),
        }
    }

    /// All keys accepted by [`Config::get`] and [`Config::set`]
    pub fn keys() -> &'static [&'static str] {
        &[
            "api.base_url",
            "api.timeout_secs",
            "api.per_page",
            "auth.allow_env_token",
            "auth.storage",
            "auth.token_path",
            "incremental.enabled",
            "incremental.full_sync_interval_hours",
            "incremental.fallback_on_error",
            "incremental.max_incremental_pages",
            "incremental.detect_unstars",
            "incremental.detect_restars",
            "incremental.timestamp_tolerance_secs",
            "incremental.restar_threshold_secs",
            "retry.max_retries",
            "retry.initial_delay_ms",
            "retry.max_delay_ms",
            "retry.backoff_multiplier",
            "retry.retry_on_rate_limit",
            "retry.rate_limit_buffer_secs",
            "logging.level",
            "logging.format",
            "storage.state_dir",
            "storage.keep_backup",
        ]
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "api.base_url" => self.api.base_url.clone(),
            "api.timeout_secs" => self.api.timeout_secs.to_string(),
            "api.per_page" => self.api.per_page.to_string(),
            "auth.allow_env_token" => self.auth.allow_env_token.to_string(),
            "auth.storage" => self.auth.storage.to_string(),
            "auth.token_path" => self.auth.token_path.display().to_string(),
            "incremental.enabled" => self.incremental.enabled.to_string(),
            "incremental.full_sync_interval_hours" => {
                self.incremental.full_sync_interval_hours.to_string()
            }
            "incremental.fallback_on_error" => self.incremental.fallback_on_error.to_string(),
            "incremental.max_incremental_pages" => {
                self.incremental.max_incremental_pages.to_string()
            }
            "incremental.detect_unstars" => self.incremental.detect_unstars.to_string(),
            "incremental.detect_restars" => self.incremental.detect_restars.to_string(),
            "incremental.timestamp_tolerance_secs" => {
                self.incremental.timestamp_tolerance_secs.to_string()
            }
            "incremental.restar_threshold_secs" => {
                self.incremental.restar_threshold_secs.to_string()
            }
            "retry.max_retries" => self.retry.max_retries.to_string(),
            "retry.initial_delay_ms" => self.retry.initial_delay_ms.to_string(),
            "retry.max_delay_ms" => self.retry.max_delay_ms.to_string(),
            "retry.backoff_multiplier" => self.retry.backoff_multiplier.to_string(),
            "retry.retry_on_rate_limit" => self.retry.retry_on_rate_limit.to_string(),
            "retry.rate_limit_buffer_secs" => self.retry.rate_limit_buffer_secs.to_string(),
            "logging.level" => self.logging.level.clone(),
            "logging.format" => self.logging.format.clone(),
            "storage.state_dir" => self.storage.state_dir.display().to_string(),
            "storage.keep_backup" => self.storage.keep_backup.to_string(),
            _ => bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || format!("Invalid value for {}: {}", key, value);
        let mut next = self.clone();
        match key {
            "api.base_url" => next.api.base_url = value.trim_end_matches('/').to_string(),
            "api.timeout_secs" => next.api.timeout_secs = value.parse().with_context(invalid)?,
            "api.per_page" => next.api.per_page = value.parse().with_context(invalid)?,
            "auth.allow_env_token" => {
                next.auth.allow_env_token = value.parse().with_context(invalid)?
            }
            "auth.storage" => next.auth.storage = value.parse().with_context(invalid)?,
            "auth.token_path" => next.auth.token_path = PathBuf::from(value),
            "incremental.enabled" => {
                next.incremental.enabled = value.parse().with_context(invalid)?
            }
            "incremental.full_sync_interval_hours" => {
                next.incremental.full_sync_interval_hours = value.parse().with_context(invalid)?
            }
            "incremental.fallback_on_error" => {
                next.incremental.fallback_on_error = value.parse().with_context(invalid)?
            }
            "incremental.max_incremental_pages" => {
                next.incremental.max_incremental_pages = value.parse().with_context(invalid)?
            }
            "incremental.detect_unstars" => {
                next.incremental.detect_unstars = value.parse().with_context(invalid)?
            }
            "incremental.detect_restars" => {
                next.incremental.detect_restars = value.parse().with_context(invalid)?
            }
            "incremental.timestamp_tolerance_secs" => {
                next.incremental.timestamp_tolerance_secs = value.parse().with_context(invalid)?
            }
            "incremental.restar_threshold_secs" => {
                next.incremental.restar_threshold_secs = value.parse().with_context(invalid)?
            }
            "retry.max_retries" => next.retry.max_retries = value.parse().with_context(invalid)?,
            "retry.initial_delay_ms" => {
                next.retry.initial_delay_ms = value.parse().with_context(invalid)?
            }
            "retry.max_delay_ms" => next.retry.max_delay_ms = value.parse().with_context(invalid)?,
            "retry.backoff_multiplier" => {
                next.retry.backoff_multiplier = value.parse().with_context(invalid)?
            }
            "retry.retry_on_rate_limit" => {
                next.retry.retry_on_rate_limit = value.parse().with_context(invalid)?
            }
            "retry.rate_limit_buffer_secs" => {
                next.retry.rate_limit_buffer_secs = value.parse().with_context(invalid)?
            }
            "logging.level" => next.logging.level = value.to_lowercase(),
            "logging.format" => next.logging.format = value.to_lowercase(),
            "storage.state_dir" => next.storage.state_dir = PathBuf::from(value),
            "storage.keep_backup" => {
                next.storage.keep_backup = value.parse().with_context(invalid)?
            }
            _ => bail!("Unknown config key: {}", key),
        }

        if let Some(problem) = next.clone().validate().into_iter().next() {
            bail!("Invalid value for {}: {}", key, problem);
        }
        *self = next;
        Ok(())
    }
}

/// Saturating conversion for config values given in seconds
pub fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}
