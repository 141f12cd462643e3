//! Core configuration loaded from environment variables.
//!
//! This mirrors the teacher repo's `Config::from_env` pattern: required
//! values fail fast via `anyhow::Context`, optional values fall back to
//! sane defaults. File-based config and env-var overrides of file values
//! are the embedding application's concern, not this crate's.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Top-level configuration for the execution core.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    pub default_timeout: Duration,
    pub default_max_retries: i32,
    pub worker_count: usize,
    pub max_queue_size: usize,
    pub chunk_size: usize,
    pub pool: PoolConfig,
    pub scheduler_tick: Duration,
    pub shutdown_drain_timeout: Duration,
    pub flush_interval: Duration,
    pub webhooks_enabled: bool,
    pub change_tracker_dir: String,
}

/// Connection pool tuning, broken out because it's also constructible
/// standalone in tests without going through environment variables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./hypersdk.db".to_string(),
            log_level: "info".to_string(),
            default_timeout: Duration::from_secs(3600),
            default_max_retries: 3,
            worker_count: 4,
            max_queue_size: 10_000,
            chunk_size: 8 * 1024 * 1024,
            pool: PoolConfig::default(),
            scheduler_tick: Duration::from_secs(1),
            shutdown_drain_timeout: Duration::from_secs(30),
            flush_interval: Duration::from_secs(60),
            webhooks_enabled: true,
            change_tracker_dir: "./hypersdk-change-tracker".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. `.env` is loaded first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            db_path: env::var("HYPERSDK_DB_PATH").unwrap_or(defaults.db_path),
            log_level: env::var("HYPERSDK_LOG_LEVEL").unwrap_or(defaults.log_level),
            default_timeout: parse_secs_env("HYPERSDK_DEFAULT_TIMEOUT_SECS", defaults.default_timeout)?,
            default_max_retries: parse_env("HYPERSDK_MAX_RETRIES", defaults.default_max_retries)?,
            worker_count: parse_env("HYPERSDK_WORKER_COUNT", defaults.worker_count)?,
            max_queue_size: parse_env("HYPERSDK_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            chunk_size: parse_env("HYPERSDK_CHUNK_SIZE", defaults.chunk_size)?,
            pool: PoolConfig {
                enabled: parse_env("HYPERSDK_POOL_ENABLED", defaults.pool.enabled)?,
                max_connections: parse_env(
                    "HYPERSDK_POOL_MAX_CONNECTIONS",
                    defaults.pool.max_connections,
                )?,
                idle_timeout: parse_secs_env(
                    "HYPERSDK_POOL_IDLE_TIMEOUT_SECS",
                    defaults.pool.idle_timeout,
                )?,
                health_check_interval: parse_secs_env(
                    "HYPERSDK_POOL_HEALTH_CHECK_INTERVAL_SECS",
                    defaults.pool.health_check_interval,
                )?,
            },
            scheduler_tick: parse_secs_env("HYPERSDK_SCHEDULER_TICK_SECS", defaults.scheduler_tick)?,
            shutdown_drain_timeout: parse_secs_env(
                "HYPERSDK_SHUTDOWN_DRAIN_TIMEOUT_SECS",
                defaults.shutdown_drain_timeout,
            )?,
            flush_interval: parse_secs_env("HYPERSDK_FLUSH_INTERVAL_SECS", defaults.flush_interval)?,
            webhooks_enabled: parse_env("HYPERSDK_WEBHOOKS_ENABLED", defaults.webhooks_enabled)?,
            change_tracker_dir: env::var("HYPERSDK_CHANGE_TRACKER_DIR")
                .unwrap_or(defaults.change_tracker_dir),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be valid")),
        Err(_) => Ok(default),
    }
}

fn parse_secs_env(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw.parse().with_context(|| format!("{key} must be a valid integer"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}
