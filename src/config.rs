//! Configuration for the replication engine
//!
//! All sections deserialize with defaults so a partial document is valid.
//! Reading the document from disk is left to the embedding application;
//! [`ReplicatorConfig::from_env`] overlays `REPLICATOR_*` variables on top of
//! the defaults.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh credentials this long before they expire
    pub refresh_margin_secs: u64,
    /// Lifetime assumed for region-scoped tokens when the source omits one
    pub region_token_lifetime_secs: u64,
    /// Lifetime assumed for bearer tokens without `expires_in`
    pub bearer_token_lifetime_secs: u64,
    pub retry: RetryConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 300,
            region_token_lifetime_secs: 12 * 60 * 60,
            bearer_token_lifetime_secs: 60,
            retry: RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            },
        }
    }
}

impl AuthConfig {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    /// Per-request timeout for metadata calls; blob streams are not bounded
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            user_agent: format!("registry-replicator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for the file-backed store; in-memory when unset
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `registry_replicator=debug`
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Transfer workers in the pool
    pub workers: usize,
    /// Pending transfer units the pool queue holds before submitters wait
    pub queue_depth: usize,
    pub max_concurrent_jobs: usize,
    /// Concurrent HEAD requests when a backend lacks bulk existence checks
    pub existence_check_concurrency: usize,
    /// Finalized runs retained per job
    pub history_limit: usize,
    pub retry: RetryConfig,
    pub auth: AuthConfig,
    pub http: HttpConfig,
    pub checkpoint: CheckpointConfig,
    pub log: LogConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            max_concurrent_jobs: 2,
            existence_check_concurrency: 8,
            history_limit: 50,
            retry: RetryConfig::default(),
            auth: AuthConfig::default(),
            http: HttpConfig::default(),
            checkpoint: CheckpointConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Defaults overlaid with `REPLICATOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(workers) = env_number("REPLICATOR_WORKERS")? {
            config.workers = workers;
        }
        if let Some(depth) = env_number("REPLICATOR_QUEUE_DEPTH")? {
            config.queue_depth = depth;
        }
        if let Some(jobs) = env_number("REPLICATOR_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = jobs;
        }
        if let Some(attempts) = env_number::<u32>("REPLICATOR_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Ok(dir) = env::var("REPLICATOR_CHECKPOINT_DIR") {
            config.checkpoint.directory = Some(PathBuf::from(dir));
        }
        if let Ok(level) = env::var("REPLICATOR_LOG") {
            config.log.level = level;
        }
        config.log.json = env::var("REPLICATOR_LOG_JSON").is_ok_and(|v| v == "true" || v == "1");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReplicationError::Configuration(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ReplicationError::Configuration(
                "queue_depth must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ReplicationError::Configuration(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.auth.retry.max_attempts == 0 {
            return Err(ReplicationError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|_| {
            ReplicationError::Configuration(format!("{} must be a number, got '{}'", name, value))
        }),
        Err(_) => Ok(None),
    }
}
