//! Error types for the check-in engine.

use crate::{RecordId, RowAddress};
use thiserror::Error;

/// All possible errors from the check-in engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    // Validation errors
    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("invalid row {row}: {reason}")]
    InvalidRow { row: RowAddress, reason: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot format version mismatch: supported up to {supported}, got {actual}")]
    SnapshotVersionMismatch { supported: u32, actual: u32 },
}

impl Error {
    /// Whether this error means the id does not exist locally.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RecordNotFound(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::RecordNotFound("att-1".into());
        assert_eq!(err.to_string(), "record not found: att-1");
        assert!(err.is_not_found());

        let err = Error::InvalidRow {
            row: RowAddress(7),
            reason: "name is empty".into(),
        };
        assert_eq!(err.to_string(), "invalid row 7: name is empty");
        assert!(!err.is_not_found());

        let err = Error::SnapshotVersionMismatch {
            supported: 1,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "snapshot format version mismatch: supported up to 1, got 3"
        );
    }
}
