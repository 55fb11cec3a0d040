//! Record types for attendee check-in data.

use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// One attendee entry.
///
/// Identity is the `id`: two records with the same id are the same logical
/// attendee regardless of where they were read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Opaque unique identifier
    pub id: RecordId,
    /// Display name (required)
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Whether the attendee has checked in
    pub present: bool,
    /// When the attendee checked in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_at: Option<Timestamp>,
    /// Whether a badge has been printed
    pub badge_printed: bool,
    /// When the badge was last printed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printed_at: Option<Timestamp>,
    /// When the attendee was registered
    pub registered_at: Timestamp,
}

impl Record {
    /// Create a record that has not checked in and has no badge yet.
    pub fn new(id: impl Into<RecordId>, name: impl Into<String>, registered_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            title: None,
            organization: None,
            present: false,
            present_at: None,
            badge_printed: false,
            printed_at: None,
            registered_at,
        }
    }

    /// Mark the attendee present.
    ///
    /// A second scan of an attendee who is already present keeps the
    /// original arrival time.
    pub fn mark_present(&mut self, at: Timestamp) {
        if !self.present {
            self.present = true;
            self.present_at = Some(at);
        }
    }

    /// Record a badge print. Reprints move `printed_at` forward.
    pub fn mark_printed(&mut self, at: Timestamp) {
        self.badge_printed = true;
        self.printed_at = Some(at);
    }

    /// Whether the record carries the fields every row needs.
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && !self.name.trim().is_empty()
    }
}

/// Synchronization bookkeeping for one locally stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Local mutations not yet confirmed written remotely
    pub pending: bool,
    /// Change stamp of the latest local mutation
    pub last_local_change: Timestamp,
    /// When the remote last confirmed the current values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confirmed_remote_write: Option<Timestamp>,
}

impl SyncState {
    /// State for a record that was just changed locally.
    pub fn changed(stamp: Timestamp) -> Self {
        Self {
            pending: true,
            last_local_change: stamp,
            last_confirmed_remote_write: None,
        }
    }

    /// State for a record whose values came from (or were accepted by) the remote.
    pub fn confirmed(stamp: Timestamp, at: Timestamp) -> Self {
        Self {
            pending: false,
            last_local_change: stamp,
            last_confirmed_remote_write: Some(at),
        }
    }
}

/// A record together with its sync state, as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub record: Record,
    pub sync: SyncState,
}
