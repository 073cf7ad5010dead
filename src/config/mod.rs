use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::client::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// tRPC base URL, e.g. https://api2.warera.io/trpc
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Ordered key list for rotation - loaded from env WARWATCH_API_KEYS
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Max in-flight requests across every caller.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_auth_retry_delay_ms")]
    pub auth_retry_delay_ms: u64,
    /// Inputs folded into one batched request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between consecutive batch requests.
    #[serde(default = "default_chunk_sleep_ms")]
    pub chunk_sleep_ms: u64,
    /// Pause between single calls when a batch falls back.
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Staged rows committed per flush during large sweeps.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobsConfig {
    #[serde(default)]
    pub long_term: LeaderJobConfig,
    #[serde(default)]
    pub short_term: LeaderJobConfig,
    #[serde(default)]
    pub listing: ListingJobConfig,
    #[serde(default)]
    pub citizens: GroupJobConfig,
    #[serde(default)]
    pub scores: GroupJobConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderJobConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_leader_interval_secs")]
    pub interval_secs: u64,
    /// Minimum gap between two sweeps, also across restarts.
    #[serde(default)]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingJobConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listing_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Size of the most recent page requested each tick.
    #[serde(default = "default_listing_page_size")]
    pub page_size: u32,
    /// Only announce items whose author belongs to this group (country id).
    #[serde(default)]
    pub author_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupJobConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Group (country) whose members are swept.
    #[serde(default)]
    pub group_id: String,
    #[serde(default = "default_group_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_group_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Pause between paginated calls for one subject.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Subjects with fewer observations are left out of the ranking.
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_base_url() -> String {
    "https://api2.warera.io/trpc".to_string()
}
fn default_concurrency() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_auth_retry_delay_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    30
}
fn default_chunk_sleep_ms() -> u64 {
    1_000
}
fn default_fallback_delay_ms() -> u64 {
    300
}
fn default_store_path() -> String {
    "database/external.db".to_string()
}
fn default_flush_every() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_leader_interval_secs() -> u64 {
    900
}
fn default_listing_interval_secs() -> u64 {
    60
}
fn default_listing_page_size() -> u32 {
    20
}
fn default_group_interval_secs() -> u64 {
    3_600
}
fn default_group_cooldown_secs() -> u64 {
    86_400
}
fn default_page_delay_ms() -> u64 {
    300
}
fn default_min_sample() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_keys: Vec::new(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            auth_retry_delay_ms: default_auth_retry_delay_ms(),
            batch_size: default_batch_size(),
            chunk_sleep_ms: default_chunk_sleep_ms(),
            fallback_delay_ms: default_fallback_delay_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            flush_every: default_flush_every(),
        }
    }
}

impl Default for LeaderJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_leader_interval_secs(),
            cooldown_secs: 0,
        }
    }
}

impl Default for ListingJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_listing_interval_secs(),
            cooldown_secs: 0,
            page_size: default_listing_page_size(),
            author_group: None,
        }
    }
}

impl Default for GroupJobConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: String::new(),
            interval_secs: default_group_interval_secs(),
            cooldown_secs: default_group_cooldown_secs(),
            page_delay_ms: default_page_delay_ms(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_sample: default_min_sample(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ApiConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            auth_retry_delay: Duration::from_millis(self.auth_retry_delay_ms),
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            api: ApiConfig::default(),
            store: StoreConfig::default(),
            jobs: JobsConfig::default(),
            scoring: ScoringConfig::default(),
            logging: LoggingConfig::default(),
        };
        if let Ok(url) = std::env::var("WARWATCH_BASE_URL") {
            config.api.base_url = url;
        }
        if let Ok(path) = std::env::var("WARWATCH_DB_PATH") {
            config.store.path = path;
        }
        config.overlay_env();
        config
    }

    // Keys never live in the config file.
    fn overlay_env(&mut self) {
        if let Ok(keys) = std::env::var("WARWATCH_API_KEYS") {
            self.api.api_keys = parse_key_list(&keys);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.is_empty() {
            return Err(ConfigError::Invalid("api.base_url is empty".to_string()));
        }
        if self.api.batch_size == 0 {
            return Err(ConfigError::Invalid("api.batch_size must be > 0".to_string()));
        }
        for (name, job) in [("citizens", &self.jobs.citizens), ("scores", &self.jobs.scores)] {
            if job.enabled && job.group_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{name}.enabled requires jobs.{name}.group_id"
                )));
            }
        }
        Ok(())
    }

    pub fn has_api_keys(&self) -> bool {
        !self.api.api_keys.is_empty()
    }
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
