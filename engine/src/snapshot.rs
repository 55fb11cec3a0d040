//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory [`LocalStore`] and a file
//! on disk, so a restarted process can answer reads before the remote is
//! reachable and still knows which records were never confirmed.
//!
//! [`LocalStore`]: crate::LocalStore

use crate::{error::Result, Error, RecordId, StoredRecord, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// When the snapshot was taken
    pub exported_at: Timestamp,
    /// Change clock high-water mark
    pub clock: Timestamp,
    /// Live records with their sync state, by id
    pub records: BTreeMap<RecordId, StoredRecord>,
    /// Deleted ids whose remote delete was still outstanding, with deletion time
    #[serde(default)]
    pub tombstones: BTreeMap<RecordId, Timestamp>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(exported_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at,
            clock: 0,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, stored: StoredRecord) {
        self.records.insert(stored.record.id.clone(), stored);
    }

    /// Add a tombstone to the snapshot.
    pub fn add_tombstone(&mut self, id: RecordId, at: Timestamp) {
        self.tombstones.insert(id, at);
    }

    /// Count of live records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Count of records with unconfirmed local changes.
    pub fn pending_count(&self) -> usize {
        self.records.values().filter(|s| s.sync.pending).count()
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::SnapshotVersionMismatch {
                supported: SNAPSHOT_FORMAT_VERSION,
                actual: self.format_version,
            });
        }

        for (id, stored) in &self.records {
            if id != &stored.record.id {
                return Err(Error::InvalidSnapshot(format!(
                    "record keyed as '{}' has id '{}'",
                    id, stored.record.id
                )));
            }
            if !stored.record.is_valid() {
                return Err(Error::InvalidSnapshot(format!(
                    "record '{}' is missing required fields",
                    id
                )));
            }
            if self.tombstones.contains_key(id) {
                return Err(Error::InvalidSnapshot(format!(
                    "record '{}' is both live and deleted",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
