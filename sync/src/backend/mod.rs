//! The remote spreadsheet as seen by the sync engine.
//!
//! Implementations perform exactly one remote call per method and classify
//! failures into [`BackendError`]. Pacing and retries are the scheduler's job.

mod memory;

pub use memory::{CallKind, MemorySheet, RecordedCall};

use crate::error::BackendResult;
use async_trait::async_trait;
use checkin_engine::{RawRow, RowAddress};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// New values for one full row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeUpdate {
    pub row: RowAddress,
    pub values: RawRow,
}

impl RangeUpdate {
    pub fn new(row: RowAddress, values: RawRow) -> Self {
        Self { row, values }
    }
}

/// Remote sheet operations.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Every data row (header excluded), in sheet order.
    async fn read_all(&self) -> BackendResult<Vec<RawRow>>;

    /// Append rows at the end, returning the address each one landed at.
    async fn append_rows(&self, rows: Vec<RawRow>) -> BackendResult<Vec<RowAddress>>;

    /// Overwrite full rows in one call. Either every range is written or none.
    async fn update_ranges(&self, updates: Vec<RangeUpdate>) -> BackendResult<()>;

    /// Delete one row. Rows below it move up by one.
    async fn delete_row(&self, row: RowAddress) -> BackendResult<()>;
}

/// Shared handle to a backend.
pub type SharedBackend = Arc<dyn RemoteBackend>;
