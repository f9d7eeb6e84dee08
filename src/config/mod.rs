//! Configuration management for the feedcycle engine
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{ScheduleDef, DEFAULT_SCHEDULE};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Cycle scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Cadence definitions; a `default` cadence is implied when absent
    pub schedules: Vec<ScheduleDef>,

    /// Fetch unit configuration
    pub fetcher: FetcherConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cycle scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shard this process serves
    pub shard_id: u32,

    /// Maximum number of URLs per batch
    pub batch_size: usize,

    /// Run batches in isolated worker processes
    pub fork_batches: bool,

    /// Number of concurrently live worker processes (0 = one per batch)
    pub parallel_batches: usize,

    /// Delay between successive in-process batches
    pub batch_delay_ms: u64,

    /// Failures before a URL is circuit-broken (0 = never)
    pub fail_limit: u32,

    /// Capacity of the outbound event bus
    pub event_capacity: usize,

    /// Source ids under verbose tracing
    pub debug_feeds: Vec<String>,

    /// URLs under verbose tracing
    pub debug_links: Vec<String>,

    /// Honour elevated-tenant capabilities (webhooks, feed limits, supporter cadence)
    pub supporters_enabled: bool,

    /// Per-tenant feed limit when no override exists (0 = unlimited)
    pub default_max_feeds: usize,

    /// Program launched for isolated workers (defaults to the running binary)
    pub worker_program: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            batch_size: 400,
            fork_batches: false,
            parallel_batches: 2,
            batch_delay_ms: 200,
            fail_limit: 0,
            event_capacity: 4096,
            debug_feeds: Vec::new(),
            debug_links: Vec::new(),
            supporters_enabled: false,
            default_max_feeds: 0,
            worker_program: None,
        }
    }
}

/// Fetch unit configuration, shipped to isolated workers with every batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetcherConfig {
    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Rate limit per worker (requests per second)
    pub requests_per_second: u32,

    /// Largest feed body read into memory, in bytes
    pub max_body_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            user_agent: format!("feedcycle/{}", env!("CARGO_PKG_VERSION")),
            requests_per_second: 10,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FetcherConfig {
    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/feedcycle.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        let s = &mut self.scheduler;
        if let Some(v) = env_parse("FEEDCYCLE_SHARD_ID") {
            s.shard_id = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_BATCH_SIZE") {
            s.batch_size = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_FORK_BATCHES") {
            s.fork_batches = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_PARALLEL_BATCHES") {
            s.parallel_batches = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_FAIL_LIMIT") {
            s.fail_limit = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_REQUEST_TIMEOUT") {
            self.fetcher.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("FEEDCYCLE_MAX_BODY_BYTES") {
            self.fetcher.max_body_bytes = v;
        }
        if let Ok(v) = std::env::var("FEEDCYCLE_USER_AGENT") {
            self.fetcher.user_agent = v;
        }
        if let Ok(v) = std::env::var("FEEDCYCLE_SQLITE_PATH") {
            self.database.sqlite_path = v.into();
        }
        if let Ok(v) = std::env::var("FEEDCYCLE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("FEEDCYCLE_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.fetcher.requests_per_second == 0 {
            anyhow::bail!("requests_per_second must be greater than 0");
        }

        if self.fetcher.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than 0");
        }

        for schedule in &self.schedules {
            if schedule.refresh_rate_minutes == 0 {
                anyhow::bail!(
                    "schedule '{}' must declare a refresh_rate_minutes greater than 0",
                    schedule.name
                );
            }
        }

        Ok(())
    }

    /// Configured cadences, with the implied `default` cadence added when missing
    pub fn schedules_or_default(&self) -> Vec<ScheduleDef> {
        let mut schedules = self.schedules.clone();
        if !schedules.iter().any(ScheduleDef::is_default) {
            schedules.insert(0, ScheduleDef::new(DEFAULT_SCHEDULE, 10));
        }
        schedules
    }

    /// Delay between in-process batches
    #[must_use]
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.scheduler.batch_delay_ms)
    }
}
