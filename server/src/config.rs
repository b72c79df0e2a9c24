//! Configuration management for the server.

use std::env;
use std::time::Duration;

use crate::sync::LockPolicy;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; in-memory storage when unset
    pub database_url: Option<String>,
    /// Upper bound on each document store call during a pass
    pub operation_timeout: Duration,
    /// What a pass does when another pass holds the device lock
    pub lock_policy: LockPolicy,
    /// Interval of the background pass scheduler; disabled when unset
    pub sync_interval: Option<Duration>,
    /// Advisory TTL for cached records
    pub cache_ttl: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            operation_timeout: Duration::from_millis(5_000),
            lock_policy: LockPolicy::Wait(Duration::from_millis(10_000)),
            sync_interval: None,
            cache_ttl: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let operation_timeout = parse_millis(&lookup, "SYNC_OPERATION_TIMEOUT_MS")?
            .unwrap_or(defaults.operation_timeout);

        let lock_timeout = parse_millis(&lookup, "SYNC_LOCK_TIMEOUT_MS")?
            .unwrap_or(Duration::from_millis(10_000));

        let lock_policy = match lookup("SYNC_LOCK_POLICY").as_deref() {
            None | Some("wait") => LockPolicy::Wait(lock_timeout),
            Some("reject") => LockPolicy::Reject,
            Some(other) => return Err(ConfigError::InvalidLockPolicy(other.to_string())),
        };

        let sync_interval = parse_secs(&lookup, "SYNC_INTERVAL_SECS")?;
        let cache_ttl = parse_secs(&lookup, "CACHE_TTL_SECS")?;

        Ok(Self {
            host,
            port,
            database_url,
            operation_timeout,
            lock_policy,
            sync_interval,
            cache_ttl,
        })
    }
}

fn parse_number<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidNumber { key, value: raw }),
            Ok(n) => Ok(Some(n)),
        },
        None => Ok(None),
    }
}

fn parse_millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_number(lookup, key)?.map(Duration::from_millis))
}

fn parse_secs<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_number(lookup, key)?.map(Duration::from_secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {key}: '{value}' (expected a positive integer)")]
    InvalidNumber { key: &'static str, value: String },

    #[error("Invalid SYNC_LOCK_POLICY '{0}' (expected 'wait' or 'reject')")]
    InvalidLockPolicy(String),
}
