//! The sync engine's public surface.

use crate::backend::{RangeUpdate, SharedBackend};
use crate::batch::{BatchAccumulator, BatchStats, FlushOutcome};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{BackendError, SyncResult};
use crate::pull::{PullDriver, ReconcileReport};
use crate::scheduler::{RequestScheduler, SchedulerStats};
use checkin_engine::{now_millis, row, LocalStore, Record, RecordId, RowAddress, Timestamp, Upsert};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counters and timestamps describing sync health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Local records with unconfirmed changes
    pub pending_count: usize,
    /// Local deletes not yet confirmed by the sheet
    pub tombstones: usize,
    /// When a pull or flush last succeeded
    pub last_sync: Option<Timestamp>,
    pub pulls: u64,
    pub failed_pulls: u64,
    pub scheduler: SchedulerStats,
    pub batch: BatchStats,
}

impl SyncStats {
    /// Submissions queued or running on the lane.
    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth
    }

    /// Attempts that hit the rate quota.
    pub fn quota_errors(&self) -> u64 {
        self.scheduler.quota_errors
    }
}

/// Outcome of a full sync round. Errors are carried, never returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub flush: Option<FlushOutcome>,
    pub flush_error: Option<String>,
    pub reconcile: Option<ReconcileReport>,
    pub pull_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.flush_error.is_none() && self.pull_error.is_none()
    }
}

/// What a remote delete did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The row was removed from the sheet
    Deleted(RowAddress),
    /// The sheet had no row for the id
    NoRemoteRow,
    /// The id was recreated locally before the delete ran
    Revived,
}

/// Coordinates the store, the batch queue, pulls and deletes.
///
/// All backend traffic goes through one [`RequestScheduler`].
pub struct SyncFacade {
    ctx: SyncContext,
    batch: BatchAccumulator,
    puller: PullDriver,
    last_sync: AtomicU64,
    pulls: AtomicU64,
    failed_pulls: AtomicU64,
    background: Mutex<JoinSet<()>>,
}

impl SyncFacade {
    /// Build the engine and start its workers on the current runtime.
    pub fn new(store: Arc<LocalStore>, backend: SharedBackend, config: &SyncConfig) -> Self {
        let ctx = SyncContext::new(store, backend, RequestScheduler::spawn(config));
        Self {
            batch: BatchAccumulator::spawn(ctx.clone(), config),
            puller: PullDriver::new(ctx.clone()),
            ctx,
            last_sync: AtomicU64::new(0),
            pulls: AtomicU64::new(0),
            failed_pulls: AtomicU64::new(0),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.ctx.store
    }

    /// Write `record` locally and queue it for the sheet if it changed.
    pub fn record_changed(&self, record: Record) -> SyncResult<Upsert> {
        let outcome = self.ctx.store.upsert(record.clone(), now_millis())?;
        self.track(record, outcome);
        Ok(outcome)
    }

    /// Queue a record the store already holds after a local write.
    pub fn track(&self, record: Record, outcome: Upsert) {
        if let Upsert::Changed(stamp) = outcome {
            self.batch.add(record, stamp);
        }
    }

    /// Read the sheet and reconcile it into the local store.
    pub async fn pull(&self) -> SyncResult<ReconcileReport> {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        match self.puller.run(&self.batch).await {
            Ok(report) => {
                self.touch();
                for id in &report.deletes_reissued {
                    self.spawn_delete(id.clone());
                }
                Ok(report)
            }
            Err(err) => {
                self.failed_pulls.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "pull failed, local data unchanged");
                Err(err)
            }
        }
    }

    /// Write queued changes now instead of waiting for the quiet period.
    pub async fn flush(&self) -> SyncResult<FlushOutcome> {
        let outcome = self.batch.flush().await?;
        if outcome.sent > 0 {
            self.touch();
        }
        Ok(outcome)
    }

    /// Flush, then pull. Never fails; errors are reported.
    pub async fn sync(&self) -> SyncReport {
        let mut report = SyncReport::default();
        match self.flush().await {
            Ok(outcome) => report.flush = Some(outcome),
            Err(err) => report.flush_error = Some(err.to_string()),
        }
        match self.pull().await {
            Ok(reconcile) => report.reconcile = Some(reconcile),
            Err(err) => report.pull_error = Some(err.to_string()),
        }
        report.finished_at = Utc::now();
        report
    }

    /// Queue every pending record again. Returns how many were queued.
    pub fn retry_pending(&self) -> usize {
        let count = self.batch.retry_pending();
        if count > 0 {
            info!(count, "requeued pending records");
        }
        count
    }

    /// Delete a record locally and remove its row from the sheet in the
    /// background. Returns false if no live record has this id.
    pub fn delete(&self, id: &str) -> bool {
        if self.ctx.store.remove(id, now_millis()).is_none() {
            return false;
        }
        self.batch.discard(id);
        self.spawn_delete(id.to_string());
        true
    }

    fn spawn_delete(&self, id: RecordId) {
        let ctx = self.ctx.clone();
        let mut background = self.background.lock();
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            match delete_remote(&ctx, id.clone()).await {
                Ok(outcome) => debug!(record_id = %id, ?outcome, "remote delete finished"),
                Err(err) => {
                    warn!(record_id = %id, error = %err, "remote delete failed, retried on next pull")
                }
            }
        });
    }

    /// Give every id-less row on the sheet a fresh id so it can be synced.
    ///
    /// Returns the number of rows repaired. The new records are adopted by
    /// the next pull.
    pub async fn repair_missing_ids(&self) -> SyncResult<usize> {
        let (rows, generation) = self.ctx.read_indexed("read_all").await?;

        let updates: Vec<RangeUpdate> = rows
            .iter()
            .enumerate()
            .filter(|(_, cells)| {
                row::row_id(cells).is_none() && cells.iter().any(|c| !c.trim().is_empty())
            })
            .map(|(i, cells)| {
                let id = uuid::Uuid::new_v4().to_string();
                RangeUpdate::new(RowAddress::for_index(i), row::with_id(cells, &id))
            })
            .collect();
        if updates.is_empty() {
            return Ok(0);
        }

        let count = updates.len();
        let ctx = self.ctx.clone();
        self.ctx
            .scheduler
            .submit(format!("repair_ids[{count}]"), move || {
                let ctx = ctx.clone();
                let updates = updates.clone();
                async move {
                    if ctx.rows.generation() != generation {
                        return Err(BackendError::permanent(
                            "rows moved since they were read, run the repair again",
                        ));
                    }
                    ctx.backend.update_ranges(updates).await
                }
            })
            .await?;

        info!(count, "assigned ids to rows without one");
        Ok(count)
    }

    /// Pull every `every` until the facade is dropped.
    pub fn spawn_auto_pull(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let facade: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(facade) = facade.upgrade() else {
                    break;
                };
                if let Err(err) = facade.pull().await {
                    debug!(error = %err, "scheduled pull failed");
                }
            }
        })
    }

    pub fn stats(&self) -> SyncStats {
        let last_sync = self.last_sync.load(Ordering::Relaxed);
        SyncStats {
            pending_count: self.ctx.store.pending_count(),
            tombstones: self.ctx.store.tombstones().len(),
            last_sync: (last_sync > 0).then_some(last_sync),
            pulls: self.pulls.load(Ordering::Relaxed),
            failed_pulls: self.failed_pulls.load(Ordering::Relaxed),
            scheduler: self.ctx.scheduler.stats(),
            batch: self.batch.stats(),
        }
    }

    /// Wait for background deletes to finish.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.background.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }

    /// Flush what is queued, stop the batch worker and wait for deletes.
    pub async fn shutdown(&self) {
        self.batch.shutdown().await;
        self.settle().await;
    }

    fn touch(&self) {
        self.last_sync.store(now_millis(), Ordering::Relaxed);
    }
}

/// Remove the row of a tombstoned id. Checked when the job runs, so a
/// record recreated meanwhile is left alone.
///
/// Rows are read first: another client may have inserted or removed rows
/// since the index was built, and a stale address deletes someone else.
async fn delete_remote(ctx: &SyncContext, id: RecordId) -> SyncResult<DeleteOutcome> {
    ctx.read_rows("read_all").await?;
    let job = ctx.clone();
    ctx.scheduler
        .submit(format!("delete_row[{id}]"), move || {
            let ctx = job.clone();
            let id = id.clone();
            async move {
                if !ctx.store.is_tombstoned(&id) {
                    return Ok(DeleteOutcome::Revived);
                }
                let Some(row) = ctx.rows.get(&id) else {
                    ctx.store.clear_tombstone(&id);
                    return Ok(DeleteOutcome::NoRemoteRow);
                };
                ctx.backend.delete_row(row).await?;
                ctx.rows.remove_row(row);
                ctx.store.clear_tombstone(&id);
                Ok(DeleteOutcome::Deleted(row))
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CallKind, MemorySheet};
    use crate::config::RetryPolicy;
    use crate::error::ErrorClass;

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_min_interval(Duration::from_millis(200))
            .with_batch_delay(Duration::from_secs(2))
            .with_retry(RetryPolicy::no_retry())
    }

    fn facade(sheet: &Arc<MemorySheet>) -> SyncFacade {
        SyncFacade::new(Arc::new(LocalStore::new()), sheet.clone(), &config())
    }

    fn attendee(id: &str, name: &str) -> Record {
        Record::new(id, name, 1_000)
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_write_is_not_queued() {
        let sheet = Arc::new(MemorySheet::new());
        let sync = facade(&sheet);

        assert!(matches!(
            sync.record_changed(attendee("a", "Ann")).unwrap(),
            Upsert::Changed(_)
        ));
        assert_eq!(
            sync.record_changed(attendee("a", "Ann")).unwrap(),
            Upsert::Unchanged
        );
        assert_eq!(sync.stats().batch.queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_the_row() {
        let sheet = Arc::new(MemorySheet::with_records(&[
            attendee("a", "Ann"),
            attendee("b", "Bob"),
            attendee("c", "Cy"),
        ]));
        let sync = facade(&sheet);
        sync.pull().await.unwrap();

        assert!(sync.delete("b"));
        assert!(!sync.delete("b"));
        sync.settle().await;

        assert!(sheet.record("b").is_none());
        assert_eq!(sheet.calls_of(CallKind::DeleteRow).len(), 1);
        assert!(!sync.store().is_tombstoned("b"));

        // Rows below moved up and the index followed
        assert!(sync.delete("c"));
        sync.settle().await;
        assert_eq!(sheet.records(), vec![attendee("a", "Ann")]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_after_rows_moved_removes_the_right_row() {
        let sheet = Arc::new(MemorySheet::with_records(&[
            attendee("a", "Ann"),
            attendee("b", "Bob"),
            attendee("c", "Cy"),
        ]));
        let sync = facade(&sheet);
        sync.pull().await.unwrap();

        // Another client removes Ann; Bob and Cy move up a row
        assert!(sheet.remove_record("a"));
        assert!(sync.delete("b"));
        sync.settle().await;

        assert_eq!(sheet.records(), vec![attendee("c", "Cy")]);
        assert!(!sync.store().is_tombstoned("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_after_rows_moved_updates_the_right_row() {
        let sheet = Arc::new(MemorySheet::with_records(&[
            attendee("a", "Ann"),
            attendee("b", "Bob"),
            attendee("c", "Cy"),
        ]));
        let sync = facade(&sheet);
        sync.pull().await.unwrap();
        assert!(sheet.remove_record("a"));

        let mut bob = attendee("b", "Bob");
        bob.mark_present(2_000);
        sync.record_changed(bob.clone()).unwrap();
        sync.flush().await.unwrap();

        assert_eq!(sheet.records(), vec![bob, attendee("c", "Cy")]);
        assert_eq!(sync.stats().pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_is_reissued_by_the_next_pull() {
        let sheet = Arc::new(MemorySheet::with_records(&[attendee("a", "Ann")]));
        let sync = facade(&sheet);
        sync.pull().await.unwrap();

        sheet.fail_times(1, ErrorClass::Transient);
        assert!(sync.delete("a"));
        sync.settle().await;
        assert!(sheet.record("a").is_some());
        assert!(sync.store().is_tombstoned("a"));

        let report = sync.pull().await.unwrap();
        assert_eq!(report.deletes_reissued, vec!["a".to_string()]);
        assert!(sync.store().get("a").is_none());
        sync.settle().await;

        assert!(sheet.record("a").is_none());
        assert_eq!(sync.stats().tombstones, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_before_first_write_never_reaches_the_sheet() {
        let sheet = Arc::new(MemorySheet::new());
        let sync = facade(&sheet);

        sync.record_changed(attendee("a", "Ann")).unwrap();
        assert!(sync.delete("a"));
        sync.settle().await;
        sync.flush().await.unwrap();

        assert!(sheet.rows().is_empty());
        assert_eq!(sheet.calls_of(CallKind::AppendRows).len(), 0);
        assert_eq!(sync.stats().tombstones, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_before_any_read_finds_the_row() {
        let sheet = Arc::new(MemorySheet::with_records(&[
            attendee("a", "Ann"),
            attendee("b", "Bob"),
        ]));
        let sync = facade(&sheet);
        // As after a snapshot restore: records known, row addresses not
        sync.store().adopt_remote(attendee("a", "Ann"), 1_000);

        assert!(sync.delete("a"));
        sync.settle().await;

        assert_eq!(sheet.records(), vec![attendee("b", "Bob")]);
        assert_eq!(sync.stats().tombstones, 0);
        assert!(sync.pull().await.unwrap().deletes_reissued.is_empty());
        assert!(sync.store().get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_reports_instead_of_failing() {
        let sheet = Arc::new(MemorySheet::new());
        let sync = facade(&sheet);
        sync.record_changed(attendee("a", "Ann")).unwrap();

        sheet.fail_times(2, ErrorClass::Permanent);
        let report = sync.sync().await;

        assert!(!report.is_success());
        assert!(report.flush_error.is_some());
        assert!(report.pull_error.is_some());
        assert_eq!(sync.stats().failed_pulls, 1);
        assert_eq!(sync.stats().pending_count, 1);

        // Nothing was lost; the next round writes the record
        let report = sync.sync().await;
        assert!(report.is_success());
        assert_eq!(report.flush.map(|f| f.appended), Some(1));
        assert_eq!(sheet.records(), vec![attendee("a", "Ann")]);
        assert_eq!(sync.stats().pending_count, 0);
        assert!(sync.stats().last_sync.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn repair_assigns_ids_to_anonymous_rows() {
        let sheet = Arc::new(MemorySheet::with_rows(vec![
            row::encode(&attendee("a", "Ann")),
            vec![String::new(), "Walk-in".into()],
            vec![String::new(); 3],
        ]));
        let sync = facade(&sheet);

        assert_eq!(sync.repair_missing_ids().await.unwrap(), 1);
        let rows = sheet.rows();
        let new_id = row::row_id(&rows[1]).unwrap().to_string();
        assert_eq!(new_id.len(), 36);
        assert_eq!(row::row_id(&rows[2]), None);

        let report = sync.pull().await.unwrap();
        assert_eq!(report.adopted, 2);
        assert_eq!(sync.store().get(&new_id).map(|r| r.name), Some("Walk-in".into()));

        // Nothing left to repair
        assert_eq!(sync.repair_missing_ids().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_pull_runs_on_schedule() {
        let sheet = Arc::new(MemorySheet::with_records(&[attendee("a", "Ann")]));
        let sync = Arc::new(facade(&sheet));
        let handle = sync.spawn_auto_pull(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sheet.calls_of(CallKind::ReadAll).len(), 0);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(sheet.calls_of(CallKind::ReadAll).len(), 1);
        assert!(sync.store().get("a").is_some());

        drop(sync);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(handle.is_finished());
    }
}
