//! Error types for the sync layer.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for calls to the remote backend.
pub type BackendResult<T> = Result<T, BackendError>;

/// Stable classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// The call rate quota was exceeded (HTTP 429). Retried with slow backoff.
    QuotaExceeded,
    /// Network failure or server error (5xx). Retried with fast backoff.
    Transient,
    /// Malformed request, missing resource, auth failure. Never retried.
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::QuotaExceeded => "quota exceeded",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        };
        f.write_str(name)
    }
}

/// A failure reported by the remote backend wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} backend error: {message}")]
pub struct BackendError {
    /// Classification driving the retry decision.
    pub class: ErrorClass,
    /// HTTP status, when the failure came with one.
    pub status: Option<u16>,
    /// Human-readable detail.
    pub message: String,
}

impl BackendError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::QuotaExceeded, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    /// Classify an HTTP status: 429 is quota, 408 and 5xx are transient,
    /// everything else is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            429 => ErrorClass::QuotaExceeded,
            408 | 500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        };
        Self {
            class,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Returns true if the scheduler may retry this error.
    pub fn is_retryable(&self) -> bool {
        self.class != ErrorClass::Permanent
    }
}

/// Errors surfaced by the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend rejected the call permanently.
    #[error("operation '{op}' rejected: {source}")]
    Permanent {
        op: String,
        #[source]
        source: BackendError,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("operation '{op}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: BackendError,
    },

    /// The next attempt could not start within the operation's time budget.
    #[error("operation '{op}' ran out of its {after:?} budget")]
    Timeout { op: String, after: Duration },

    /// The scheduler worker is gone.
    #[error("request scheduler is not running")]
    SchedulerClosed,

    /// Local store error.
    #[error("engine error: {0}")]
    Engine(#[from] checkin_engine::Error),

    /// Snapshot file error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// The backend classification behind this error, if any.
    ///
    /// Timeouts have no backend class of their own.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            SyncError::Permanent { source, .. } => Some(source.class),
            SyncError::RetriesExhausted { last, .. } => Some(last.class),
            _ => None,
        }
    }

    /// Returns true if running the operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RetriesExhausted { .. } | SyncError::Timeout { .. }
        )
    }

    /// Returns true if this is a missing local record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Engine(err) if err.is_not_found())
    }
}
