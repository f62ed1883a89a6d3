//! Configuration for the data service and the server binary.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use stowage_engine::RetryPolicy;

/// Tunables of a [`DataService`](crate::DataService).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of cached documents
    pub cache_capacity: usize,
    /// Number of recent cache lookups the hit rate is computed over
    pub hit_rate_window: usize,
    /// Backoff shared by queue drains and feed reconnects
    pub retry: RetryPolicy,
    /// Upper bound on any single remote call
    pub remote_timeout: Duration,
    /// Periodic drain, in addition to connect and enqueue triggers
    pub drain_interval: Duration,
    /// Remote heartbeat interval
    pub heartbeat_interval: Duration,
    /// Poll interval of HTTP change feeds
    pub poll_interval: Duration,
    /// How long confirmed tombstones are kept before purging
    pub tombstone_retention: Duration,
    pub gc_interval: Duration,
    /// Open a collection feed on first read or query
    pub auto_subscribe: bool,
    /// Capacity of the sync event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            hit_rate_window: 1000,
            retry: RetryPolicy::default(),
            remote_timeout: Duration::from_secs(10),
            drain_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            poll_interval: Duration::from_secs(2),
            tombstone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            gc_interval: Duration::from_secs(60 * 60),
            auto_subscribe: true,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Apply `STOWAGE_*` overrides from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry = RetryPolicy::new(
            env_or("STOWAGE_RETRY_BASE_MS", defaults.retry.base_ms)?,
            env_or("STOWAGE_RETRY_MULTIPLIER", defaults.retry.multiplier)?,
            env_or("STOWAGE_RETRY_CAP_MS", defaults.retry.cap_ms)?,
            env_or("STOWAGE_RETRY_CEILING", defaults.retry.ceiling)?,
        );

        Ok(Self {
            cache_capacity: env_or("STOWAGE_CACHE_CAPACITY", defaults.cache_capacity)?,
            hit_rate_window: env_or("STOWAGE_HIT_RATE_WINDOW", defaults.hit_rate_window)?,
            retry,
            remote_timeout: env_millis("STOWAGE_REMOTE_TIMEOUT_MS", defaults.remote_timeout)?,
            drain_interval: env_millis("STOWAGE_DRAIN_INTERVAL_MS", defaults.drain_interval)?,
            heartbeat_interval: env_millis(
                "STOWAGE_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            poll_interval: env_millis("STOWAGE_POLL_INTERVAL_MS", defaults.poll_interval)?,
            tombstone_retention: env_millis(
                "STOWAGE_TOMBSTONE_RETENTION_MS",
                defaults.tombstone_retention,
            )?,
            gc_interval: env_millis("STOWAGE_GC_INTERVAL_MS", defaults.gc_interval)?,
            auto_subscribe: env_or("STOWAGE_AUTO_SUBSCRIBE", defaults.auto_subscribe)?,
            event_capacity: defaults.event_capacity,
        })
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// SQLite URL of the offline store
    pub database_url: String,
    /// Base URL of the remote document API; an in-process store is used when unset
    pub remote_url: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://stowage.db".to_string());

        let remote_url = env::var("REMOTE_URL").ok().filter(|url| !url.is_empty());

        Ok(Self {
            host,
            port,
            database_url,
            remote_url,
            engine: EngineConfig::from_env()?,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_or(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_capacity, 1000);
        assert_eq!(config.retry.ceiling, 5);
        assert_eq!(config.remote_timeout, Duration::from_secs(10));
        assert!(config.auto_subscribe);
    }

    #[test]
    fn invalid_override_is_reported() {
        env::set_var("STOWAGE_TEST_ONLY_NUMBER", "many");
        let err = env_or::<usize>("STOWAGE_TEST_ONLY_NUMBER", 3).unwrap_err();
        assert!(err.to_string().contains("STOWAGE_TEST_ONLY_NUMBER"));
        env::remove_var("STOWAGE_TEST_ONLY_NUMBER");
    }

    #[test]
    fn missing_override_uses_default() {
        assert_eq!(env_or("STOWAGE_TEST_ONLY_UNSET", 42u64).unwrap(), 42);
        assert_eq!(
            env_millis("STOWAGE_TEST_ONLY_UNSET", Duration::from_secs(2)).unwrap(),
            Duration::from_secs(2)
        );
    }
}
