//! Reconciliation of local state with a remote snapshot.
//!
//! Several clients edit the sheet directly, and their clocks cannot be
//! trusted, so conflicts are not settled by timestamps. The rule is instead:
//! whoever holds unconfirmed work keeps it.
//!
//! # Algorithm
//!
//! 1. Decode remote rows; rows without an id are skipped, rows that fail to
//!    decode are reported, later rows repeating an id are reported as
//!    duplicates (the first row wins)
//! 2. Walk the union of local and remote ids in sorted order
//! 3. Remote only: adopt it, unless the id is tombstoned locally, in which
//!    case the delete is issued again
//! 4. Local only: push it
//! 5. Both: a pending local copy wins, a confirmed local copy loses
//! 6. Tombstoned ids the remote no longer has are released
//!
//! The plan is pure data. Applying it is left to the caller, which re-checks
//! each record because local edits may land between planning and applying.

use crate::{
    row::{self, RowOutcome},
    RawRow, Record, RecordId, RowAddress, StoredRecord, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local copy had unconfirmed changes and was kept
    LocalWins,
    /// Local copy was confirmed; the remote edit replaced it
    RemoteWins,
}

/// An id present on both sides with different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: RecordId,
    pub local: Record,
    pub remote: Record,
    pub resolution: ConflictResolution,
}

/// What reconciliation decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    /// Local store was empty and the remote was not
    pub bootstrap: bool,
    /// Remote held no valid records while local did
    pub remote_empty: bool,
    /// Remote records to adopt into the local store
    pub adopt: Vec<Record>,
    /// Local-only records to mark pending and push
    pub push: Vec<RecordId>,
    /// Pending local records that won a conflict and must be written again
    pub requeue: Vec<RecordId>,
    /// Pending local records the remote already holds, with the stamp seen
    pub confirm: Vec<(RecordId, Timestamp)>,
    /// Divergent ids and how each was resolved
    pub conflicts: Vec<Conflict>,
    /// Ids present and equal on both sides
    pub unchanged: usize,
    /// Tombstoned ids still present remotely
    pub reissue_deletes: Vec<RecordId>,
    /// Tombstoned ids the remote no longer has
    pub cleared_tombstones: Vec<RecordId>,
    /// Address of every id seen remotely (first occurrence)
    pub row_index: Vec<(RecordId, RowAddress)>,
    /// Number of data rows read, including skipped ones
    pub row_count: usize,
    /// Rows without an id
    pub skipped_rows: Vec<RowAddress>,
    /// Rows with an id that failed to decode, with the reason
    pub invalid_rows: Vec<(RowAddress, String)>,
    /// Later rows repeating an id already seen
    pub duplicate_rows: Vec<(RecordId, RowAddress)>,
}

impl ReconcilePlan {
    /// Number of conflicts found.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Check if applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.adopt.is_empty()
            && self.push.is_empty()
            && self.requeue.is_empty()
            && self.confirm.is_empty()
            && self.reissue_deletes.is_empty()
            && self.cleared_tombstones.is_empty()
    }
}

/// Builds a [`ReconcilePlan`] from local state and remote rows.
#[derive(Debug, Default)]
pub struct Reconciler {
    local: BTreeMap<RecordId, StoredRecord>,
    tombstones: BTreeSet<RecordId>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load live local records.
    pub fn load_local(&mut self, records: impl IntoIterator<Item = StoredRecord>) {
        for stored in records {
            self.local.insert(stored.record.id.clone(), stored);
        }
    }

    /// Load ids deleted locally whose remote delete is outstanding.
    pub fn load_tombstones(&mut self, ids: impl IntoIterator<Item = RecordId>) {
        self.tombstones.extend(ids);
    }

    /// Reconcile against the remote data rows, in sheet order.
    pub fn reconcile(self, rows: &[RawRow]) -> ReconcilePlan {
        let mut plan = ReconcilePlan {
            row_count: rows.len(),
            ..ReconcilePlan::default()
        };

        let remote = decode_rows(rows, &mut plan);

        plan.bootstrap = self.local.is_empty() && self.tombstones.is_empty() && !remote.is_empty();
        plan.remote_empty = remote.is_empty() && !self.local.is_empty();

        let ids: BTreeSet<&RecordId> = self.local.keys().chain(remote.keys()).collect();

        for id in ids {
            match (self.local.get(id), remote.get(id)) {
                (None, Some(remote_record)) if !self.tombstones.contains(id) => {
                    plan.adopt.push(remote_record.clone());
                }
                (Some(_), None) => plan.push.push(id.clone()),
                (Some(local), Some(remote_record)) => {
                    merge_both(local, remote_record, &mut plan);
                }
                _ => {}
            }
        }

        // A tombstoned id with any remote row, valid or not, is deleted again
        let remote_ids: BTreeSet<&str> = plan.row_index.iter().map(|(id, _)| id.as_str()).collect();
        let (reissue, cleared): (Vec<RecordId>, Vec<RecordId>) = self
            .tombstones
            .iter()
            .cloned()
            .partition(|id| remote_ids.contains(id.as_str()));
        plan.reissue_deletes = reissue;
        plan.cleared_tombstones = cleared;

        plan
    }
}

fn merge_both(local: &StoredRecord, remote: &Record, plan: &mut ReconcilePlan) {
    let id = &local.record.id;

    if local.record == *remote {
        if local.sync.pending {
            plan.confirm.push((id.clone(), local.sync.last_local_change));
        } else {
            plan.unchanged += 1;
        }
        return;
    }

    let resolution = if local.sync.pending {
        plan.requeue.push(id.clone());
        ConflictResolution::LocalWins
    } else {
        plan.adopt.push(remote.clone());
        ConflictResolution::RemoteWins
    };

    plan.conflicts.push(Conflict {
        id: id.clone(),
        local: local.record.clone(),
        remote: remote.clone(),
        resolution,
    });
}

/// Decode rows into records by id, filling the row bookkeeping of the plan.
fn decode_rows(rows: &[RawRow], plan: &mut ReconcilePlan) -> BTreeMap<RecordId, Record> {
    let mut remote = BTreeMap::new();
    let mut seen = BTreeSet::new();

    for (index, cells) in rows.iter().enumerate() {
        let address = RowAddress::for_index(index);
        let Some(id) = row::row_id(cells) else {
            plan.skipped_rows.push(address);
            continue;
        };
        if !seen.insert(id.to_string()) {
            plan.duplicate_rows.push((id.to_string(), address));
            continue;
        }
        plan.row_index.push((id.to_string(), address));

        match row::decode(address, cells) {
            Ok(RowOutcome::Record(record)) => {
                remote.insert(record.id.clone(), record);
            }
            Ok(RowOutcome::MissingId) => plan.skipped_rows.push(address),
            Err(err) => plan.invalid_rows.push((address, err.to_string())),
        }
    }

    remote
}
