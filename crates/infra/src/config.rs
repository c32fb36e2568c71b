//! Job engine configuration.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file. Unset variables keep their defaults; malformed ones are rejected.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::jobs::{RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::kv::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which store backend the engine persists to.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    #[serde(alias = "redis")]
    Persistent,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "persistent" | "redis" => Ok(StoreKind::Persistent),
            other => Err(format!("expected memory or persistent, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub backoff_multiplier: f64,
    pub dlq_entry_ttl: Duration,
    pub job_ttl: Duration,
    pub store: StoreKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub retry_poll_interval: Duration,
    pub retry_sweep_page_size: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: policy.base_delay,
            retry_max_delay: policy.max_delay,
            backoff_multiplier: policy.multiplier,
            dlq_entry_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            job_ttl: Duration::from_secs(72 * 60 * 60),
            store: StoreKind::Memory,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry_poll_interval: Duration::from_secs(10),
            retry_sweep_page_size: 100,
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl JobSettings {
    /// Load `.env` (if present) and read the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(v) = get("JOB_MAX_RETRIES") {
            settings.max_retries = parse("JOB_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("JOB_RETRY_BASE_DELAY_SECONDS") {
            settings.retry_base_delay = seconds("JOB_RETRY_BASE_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = get("JOB_RETRY_MAX_DELAY_SECONDS") {
            settings.retry_max_delay = seconds("JOB_RETRY_MAX_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = get("JOB_RETRY_BACKOFF_MULTIPLIER") {
            let multiplier: f64 = parse("JOB_RETRY_BACKOFF_MULTIPLIER", &v)?;
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(invalid("JOB_RETRY_BACKOFF_MULTIPLIER", v, "must be a finite number >= 1"));
            }
            settings.backoff_multiplier = multiplier;
        }
        if let Some(v) = get("DLQ_ENTRY_TTL_DAYS") {
            let days: u64 = parse("DLQ_ENTRY_TTL_DAYS", &v)?;
            if days == 0 {
                return Err(invalid("DLQ_ENTRY_TTL_DAYS", v, "must be positive"));
            }
            settings.dlq_entry_ttl = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(v) = get("JOB_TTL_HOURS") {
            let hours: u64 = parse("JOB_TTL_HOURS", &v)?;
            if hours == 0 {
                return Err(invalid("JOB_TTL_HOURS", v, "must be positive"));
            }
            settings.job_ttl = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(v) = get("JOB_STORE_TYPE") {
            settings.store = parse("JOB_STORE_TYPE", &v)?;
        }
        settings.redis_url = get("REDIS_URL").map(|v| v.trim().to_string());
        if let Some(v) = get("JOB_KEY_PREFIX") {
            settings.key_prefix = v.trim().to_string();
        }
        if let Some(v) = get("JOB_RETRY_POLL_INTERVAL_SECONDS") {
            let interval = seconds("JOB_RETRY_POLL_INTERVAL_SECONDS", &v)?;
            if interval.is_zero() {
                return Err(invalid("JOB_RETRY_POLL_INTERVAL_SECONDS", v, "must be positive"));
            }
            settings.retry_poll_interval = interval;
        }
        if let Some(v) = get("JOB_RETRY_SWEEP_PAGE_SIZE") {
            let size: usize = parse("JOB_RETRY_SWEEP_PAGE_SIZE", &v)?;
            if size == 0 {
                return Err(invalid("JOB_RETRY_SWEEP_PAGE_SIZE", v, "must be positive"));
            }
            settings.retry_sweep_page_size = size;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid(
                "JOB_RETRY_MAX_DELAY_SECONDS",
                self.retry_max_delay.as_secs_f64(),
                "must not be below the base delay",
            ));
        }
        if self.store == StoreKind::Persistent && self.redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_base_delay,
            self.retry_max_delay,
            self.backoff_multiplier,
        )
    }
}

/// Non-negative (possibly fractional) seconds.
fn seconds(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, raw)?;
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, raw, &e.to_string()))
}
