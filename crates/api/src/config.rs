//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ledgerline_core::LedgerCurrency;
use ledgerline_infra::jobs::{
    BackoffStrategy, DEFAULT_JOB_RETENTION, JobExecutorConfig, RetryPolicy, RetryScope,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required when USE_PERSISTENT_STORES=true")]
    Missing { var: &'static str },
    #[error("invalid {var}='{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub currency: LedgerCurrency,
    pub retry_policy: RetryPolicy,
    pub executor: JobExecutorConfig,
    /// How long finished jobs stay pollable before they are pruned
    pub job_retention: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            currency: LedgerCurrency::default(),
            retry_policy: RetryPolicy::default(),
            executor: JobExecutorConfig::default(),
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and empty variables take
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let bind_addr = parse_or("BIND_ADDR", get("BIND_ADDR"), defaults.bind_addr)?;
        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool("USE_PERSISTENT_STORES", &raw)?,
            None => false,
        };

        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing {
                var: "DATABASE_URL",
            });
        }

        let currency = match get("LEDGER_CURRENCY") {
            Some(raw) => LedgerCurrency::from_code(&raw).map_err(|e| ConfigError::Invalid {
                var: "LEDGER_CURRENCY",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.currency,
        };

        let max_attempts: u32 = parse_or(
            "TRANSFER_MAX_ATTEMPTS",
            get("TRANSFER_MAX_ATTEMPTS"),
            defaults.retry_policy.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(invalid("TRANSFER_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let backoff_ms: u64 = parse_or(
            "TRANSFER_BACKOFF_MS",
            get("TRANSFER_BACKOFF_MS"),
            defaults.retry_policy.base_delay.as_millis() as u64,
        )?;
        let strategy: BackoffStrategy =
            parse_or("TRANSFER_BACKOFF", get("TRANSFER_BACKOFF"), BackoffStrategy::Fixed)?;
        let scope: RetryScope = parse_or(
            "TRANSFER_RETRY_SCOPE",
            get("TRANSFER_RETRY_SCOPE"),
            RetryScope::TransientOnly,
        )?;

        let base_delay = Duration::from_millis(backoff_ms);
        let retry_policy = RetryPolicy {
            max_attempts,
            base_delay,
            max_delay: defaults.retry_policy.max_delay.max(base_delay),
            strategy,
            scope,
        };

        let workers: usize =
            parse_or("QUEUE_WORKERS", get("QUEUE_WORKERS"), defaults.executor.workers)?;
        if workers == 0 {
            return Err(invalid("QUEUE_WORKERS", "0", "must be at least 1"));
        }
        let poll_ms: u64 = parse_or(
            "QUEUE_POLL_MS",
            get("QUEUE_POLL_MS"),
            defaults.executor.poll_interval.as_millis() as u64,
        )?;
        if poll_ms == 0 {
            return Err(invalid("QUEUE_POLL_MS", "0", "must be at least 1"));
        }

        let lease_ms: u64 = parse_or(
            "QUEUE_LEASE_MS",
            get("QUEUE_LEASE_MS"),
            defaults.executor.lease.as_millis() as u64,
        )?;
        if lease_ms == 0 {
            return Err(invalid("QUEUE_LEASE_MS", "0", "must be at least 1"));
        }
        let retention_secs: u64 = parse_or(
            "QUEUE_RETENTION_SECS",
            get("QUEUE_RETENTION_SECS"),
            defaults.job_retention.as_secs(),
        )?;

        let executor = JobExecutorConfig::default()
            .with_workers(workers)
            .with_poll_interval(Duration::from_millis(poll_ms))
            .with_lease(Duration::from_millis(lease_ms));

        Ok(Self {
            bind_addr,
            use_persistent_stores,
            database_url,
            currency,
            retry_policy,
            executor,
            job_retention: Duration::from_secs(retention_secs),
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw, "expected true or false")),
    }
}
