//! Full read of the sheet and reconciliation into the local store.

use crate::batch::BatchAccumulator;
use crate::context::SyncContext;
use crate::error::SyncResult;
use checkin_engine::{now_millis, Adopt, Conflict, ReconcilePlan, Reconciler, RecordId};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What one pull changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// The local store was empty and was filled from the sheet
    pub bootstrap: bool,
    /// The sheet held no records while the local store did
    pub remote_empty: bool,
    /// Data rows read
    pub remote_rows: usize,
    /// Remote records written into the local store
    pub adopted: usize,
    /// Local records queued for writing
    pub pushed: usize,
    /// Pending records the sheet already matched
    pub confirmed: usize,
    /// Records equal on both sides
    pub unchanged: usize,
    /// Ids that differed on both sides
    pub conflicts: Vec<Conflict>,
    /// Remote copies skipped because the local copy changed meanwhile
    pub kept_local: usize,
    /// Rows without an id
    pub skipped_rows: usize,
    /// Rows with an id that could not be decoded
    pub invalid_rows: usize,
    /// Rows repeating an id seen on an earlier row
    pub duplicate_rows: usize,
    /// Locally deleted ids still on the sheet
    pub deletes_reissued: Vec<RecordId>,
    /// Tombstones dropped because the sheet no longer has the id
    pub tombstones_cleared: usize,
}

impl ReconcileReport {
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }
}

/// Runs pulls against the sheet.
pub(crate) struct PullDriver {
    ctx: SyncContext,
}

impl PullDriver {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Read the sheet and reconcile. A failed read leaves the store as it was.
    pub async fn run(&self, batch: &BatchAccumulator) -> SyncResult<ReconcileReport> {
        let rows = self.ctx.read_rows("read_all").await?;

        let mut reconciler = Reconciler::new();
        reconciler.load_local(self.ctx.store.entries());
        reconciler.load_tombstones(self.ctx.store.tombstones());
        let plan = reconciler.reconcile(&rows);

        for (row, reason) in &plan.invalid_rows {
            warn!(%row, %reason, "skipping unreadable row");
        }
        for (id, row) in &plan.duplicate_rows {
            warn!(record_id = %id, %row, "skipping row repeating an id");
        }
        if plan.remote_empty {
            warn!(
                local = self.ctx.store.len(),
                "sheet holds no records, keeping local data"
            );
        }

        Ok(self.apply(plan, batch))
    }

    fn apply(&self, plan: ReconcilePlan, batch: &BatchAccumulator) -> ReconcileReport {
        let store = &self.ctx.store;
        let now = now_millis();
        let mut report = ReconcileReport {
            bootstrap: plan.bootstrap,
            remote_empty: plan.remote_empty,
            remote_rows: plan.row_count,
            unchanged: plan.unchanged,
            skipped_rows: plan.skipped_rows.len(),
            invalid_rows: plan.invalid_rows.len(),
            duplicate_rows: plan.duplicate_rows.len(),
            deletes_reissued: plan.reissue_deletes,
            conflicts: plan.conflicts,
            ..ReconcileReport::default()
        };

        for (id, stamp) in plan.confirm {
            if store.confirm_synced(&id, stamp, now) {
                report.confirmed += 1;
            }
        }

        let mut requeue = plan.requeue;
        if plan.bootstrap {
            report.adopted = store.replace_all(plan.adopt, now);
        } else {
            for record in plan.adopt {
                let id = record.id.clone();
                match store.adopt_remote(record, now) {
                    Adopt::Inserted | Adopt::Replaced => report.adopted += 1,
                    Adopt::Unchanged => report.unchanged += 1,
                    Adopt::KeptPending => {
                        report.kept_local += 1;
                        requeue.push(id);
                    }
                    Adopt::Tombstoned => report.deletes_reissued.push(id),
                }
            }
        }

        for id in plan.push {
            // Confirmed-but-missing records get a fresh stamp here
            if store.set_pending(&id, true, now).is_ok() {
                requeue.push(id);
            }
        }

        for id in requeue {
            if let Some(entry) = store.entry(&id) {
                if entry.sync.pending {
                    batch.add(entry.record, entry.sync.last_local_change);
                    report.pushed += 1;
                }
            }
        }

        for id in plan.cleared_tombstones {
            if store.clear_tombstone(&id) {
                report.tombstones_cleared += 1;
            }
        }

        if report.bootstrap {
            info!(adopted = report.adopted, "local store bootstrapped from sheet");
        } else {
            debug!(
                adopted = report.adopted,
                pushed = report.pushed,
                conflicts = report.conflict_count(),
                confirmed = report.confirmed,
                deletes = report.deletes_reissued.len(),
                "pull reconciled"
            );
        }

        report
    }
}
