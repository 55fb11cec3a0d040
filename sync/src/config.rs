//! Configuration for the sync engine.

use crate::error::ErrorClass;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Retry behaviour for outbound calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// First delay after a quota error; doubles on each retry.
    pub quota_backoff_base: Duration,
    /// Upper bound for quota backoff.
    pub quota_backoff_max: Duration,
    /// Linear step for transient errors (step, 2*step, 3*step, ...).
    pub transient_backoff_step: Duration,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries with default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            quota_backoff_base: Duration::from_secs(10),
            quota_backoff_max: Duration::from_secs(120),
            transient_backoff_step: Duration::from_secs(2),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_quota_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.quota_backoff_base = base;
        self.quota_backoff_max = max;
        self
    }

    pub fn with_transient_backoff(mut self, step: Duration) -> Self {
        self.transient_backoff_step = step;
        self
    }

    /// This policy with its first quota delay raised above `min_interval`.
    ///
    /// A base at or below `min_interval` becomes twice `min_interval`.
    pub fn floored_at(mut self, min_interval: Duration) -> Self {
        if self.quota_backoff_base <= min_interval {
            self.quota_backoff_base = min_interval
                .saturating_mul(2)
                .max(Duration::from_millis(1));
            self.quota_backoff_max = self.quota_backoff_max.max(self.quota_backoff_base);
        }
        self
    }

    /// Delay before retry number `retry` (1-based) after an error of `class`.
    ///
    /// Returns `None` for permanent errors, which are never retried.
    pub fn delay_for(&self, class: ErrorClass, retry: u32) -> Option<Duration> {
        let retry = retry.max(1);
        match class {
            ErrorClass::QuotaExceeded => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                Some(
                    self.quota_backoff_base
                        .saturating_mul(factor)
                        .min(self.quota_backoff_max),
                )
            }
            ErrorClass::Transient => Some(self.transient_backoff_step.saturating_mul(retry)),
            ErrorClass::Permanent => None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Minimum spacing between the starts of two outbound calls.
    pub min_interval: Duration,
    /// Retry behaviour.
    pub retry: RetryPolicy,
    /// Budget for one operation including all of its retries.
    pub operation_timeout: Duration,
    /// Quiet period after the last change before a batch is written.
    pub batch_delay: Duration,
    /// Batch size that triggers an immediate write.
    pub max_batch_size: usize,
    /// Interval for automatic pulls; `None` disables them.
    pub pull_interval: Option<Duration>,
    /// Where the local store is persisted; `None` keeps it in memory only.
    pub snapshot_path: Option<PathBuf>,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(300),
            batch_delay: Duration::from_secs(5),
            max_batch_size: 50,
            pull_interval: None,
            snapshot_path: None,
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Load configuration from a `.env` file (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new();
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => parse_number::<u64>(key, &value).map(Duration::from_millis),
                None => Ok(default),
            }
        };

        let retry = RetryPolicy {
            max_retries: match lookup("SYNC_MAX_RETRIES") {
                Some(value) => parse_number("SYNC_MAX_RETRIES", &value)?,
                None => defaults.retry.max_retries,
            },
            quota_backoff_base: millis(
                "SYNC_QUOTA_BACKOFF_BASE_MS",
                defaults.retry.quota_backoff_base,
            )?,
            quota_backoff_max: millis(
                "SYNC_QUOTA_BACKOFF_MAX_MS",
                defaults.retry.quota_backoff_max,
            )?,
            transient_backoff_step: millis(
                "SYNC_TRANSIENT_BACKOFF_MS",
                defaults.retry.transient_backoff_step,
            )?,
        };

        let max_batch_size = match lookup("SYNC_MAX_BATCH_SIZE") {
            Some(value) => parse_number("SYNC_MAX_BATCH_SIZE", &value)?,
            None => defaults.max_batch_size,
        };
        if max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_MAX_BATCH_SIZE",
                value: "0".into(),
            });
        }

        let pull_interval = match lookup("SYNC_PULL_INTERVAL_MS") {
            Some(value) => match parse_number::<u64>("SYNC_PULL_INTERVAL_MS", &value)? {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            None => None,
        };

        let min_interval = millis("SYNC_MIN_INTERVAL_MS", defaults.min_interval)?;
        // Quota backoff must wait longer than normal pacing
        if retry.quota_backoff_base <= min_interval {
            return Err(ConfigError::Invalid {
                key: "SYNC_QUOTA_BACKOFF_BASE_MS",
                value: retry.quota_backoff_base.as_millis().to_string(),
            });
        }

        Ok(Self {
            min_interval,
            retry,
            operation_timeout: millis("SYNC_OPERATION_TIMEOUT_MS", defaults.operation_timeout)?,
            batch_delay: millis("SYNC_BATCH_DELAY_MS", defaults.batch_delay)?,
            max_batch_size,
            pull_interval,
            snapshot_path: lookup("SNAPSHOT_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
