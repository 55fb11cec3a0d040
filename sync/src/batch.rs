//! Debounced batching of local changes.
//!
//! Changes are queued per record, newest stamp wins. A background task
//! flushes the queue once no change arrived for `batch_delay`, or as soon as
//! the queue reaches `max_batch_size`. A flush makes at most one
//! `update_ranges` call for records already on the sheet and one
//! `append_rows` call for the rest.

use crate::backend::RangeUpdate;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::SyncResult;
use checkin_engine::{now_millis, row, RawRow, Record, RecordId, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Queued {
    record: Record,
    stamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// A change arrived; restart the quiet period
    Kick,
    /// The queue is full; flush now
    Flush,
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    /// Records taken from the queue
    pub sent: usize,
    /// Records written over their existing rows
    pub updated: usize,
    /// Records appended as new rows
    pub appended: usize,
    /// Written records whose pending flag was cleared
    pub confirmed: usize,
    /// Written records that changed again while in flight and stay pending
    pub superseded: usize,
    /// Records left out at send time (deleted, or moved between paths)
    pub deferred: usize,
}

/// Point-in-time view of the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Records waiting for the next flush
    pub queued: usize,
    /// Flushes that completed without error
    pub flushes: u64,
    /// Records written to the sheet
    pub records_written: u64,
    /// Flushes that hit an error
    pub failed_flushes: u64,
}

#[derive(Debug, Default)]
struct Written {
    written: Vec<Queued>,
    deferred: Vec<Queued>,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    records_written: AtomicU64,
    failed_flushes: AtomicU64,
}

struct BatchShared {
    ctx: SyncContext,
    queue: Mutex<HashMap<RecordId, Queued>>,
    signals: Mutex<Option<mpsc::UnboundedSender<Signal>>>,
    flush_turn: tokio::sync::Mutex<()>,
    max_batch_size: usize,
    counters: Counters,
}

/// Collects changed records and writes them in batches.
pub struct BatchAccumulator {
    shared: Arc<BatchShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchAccumulator {
    /// Create the accumulator and start its debounce task.
    pub(crate) fn spawn(ctx: SyncContext, config: &SyncConfig) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(BatchShared {
            ctx,
            queue: Mutex::new(HashMap::new()),
            signals: Mutex::new(Some(signals)),
            flush_turn: tokio::sync::Mutex::new(()),
            max_batch_size: config.max_batch_size.max(1),
            counters: Counters::default(),
        });
        let worker = tokio::spawn(debounce(
            Arc::clone(&shared),
            receiver,
            config.batch_delay,
        ));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `record` as changed with `stamp`. Never blocks.
    pub fn add(&self, record: Record, stamp: Timestamp) {
        let queued = self.shared.enqueue(record, stamp);
        let signal = if queued >= self.shared.max_batch_size {
            Signal::Flush
        } else {
            Signal::Kick
        };
        self.shared.signal(signal);
    }

    /// Drop a queued change. Returns true if one was queued.
    pub fn discard(&self, id: &str) -> bool {
        self.shared.queue.lock().remove(id).is_some()
    }

    /// Queue every pending record in the store again.
    pub fn retry_pending(&self) -> usize {
        let pending = self.shared.ctx.store.pending_records();
        let count = pending.len();
        for (record, stamp) in pending {
            self.shared.enqueue(record, stamp);
        }
        if count > 0 {
            self.shared.signal(Signal::Kick);
        }
        count
    }

    /// Write the queue now.
    pub async fn flush(&self) -> SyncResult<FlushOutcome> {
        self.shared.flush().await
    }

    /// Records waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn stats(&self) -> BatchStats {
        let counters = &self.shared.counters;
        BatchStats {
            queued: self.queued(),
            flushes: counters.flushes.load(Ordering::Relaxed),
            records_written: counters.records_written.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Stop the debounce task after a final flush.
    pub async fn shutdown(&self) {
        drop(self.shared.signals.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "batch worker ended abnormally");
            }
        }
    }
}

impl Drop for BatchAccumulator {
    fn drop(&mut self) {
        // Closing the channel lets the debounce task flush and exit
        drop(self.shared.signals.lock().take());
    }
}

impl BatchShared {
    /// Queue a change, keeping the newest stamp per record. Returns the queue
    /// length.
    fn enqueue(&self, record: Record, stamp: Timestamp) -> usize {
        let mut queue = self.queue.lock();
        match queue.get(&record.id) {
            Some(existing) if existing.stamp > stamp => {}
            _ => {
                queue.insert(record.id.clone(), Queued { record, stamp });
            }
        }
        queue.len()
    }

    fn signal(&self, signal: Signal) {
        if let Some(sender) = self.signals.lock().as_ref() {
            // The receiver only goes away together with the sender
            let _ = sender.send(signal);
        }
    }

    async fn flush(&self) -> SyncResult<FlushOutcome> {
        let _turn = self.flush_turn.lock().await;
        let needs_read = {
            let queue = self.queue.lock();
            if queue.is_empty() {
                return Ok(FlushOutcome::default());
            }
            !self.ctx.rows.is_loaded() || queue.keys().any(|id| self.ctx.rows.get(id).is_some())
        };

        // Other clients insert and delete rows, so cached addresses are only
        // trusted right after a read
        if needs_read {
            if let Err(err) = self.ctx.read_rows("read_all").await {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }

        let mut batch: Vec<Queued> = self.queue.lock().drain().map(|(_, q)| q).collect();
        if batch.is_empty() {
            return Ok(FlushOutcome::default());
        }
        batch.sort_by(|a, b| a.record.id.cmp(&b.record.id));

        let (known, fresh): (Vec<Queued>, Vec<Queued>) = batch
            .into_iter()
            .partition(|q| self.ctx.rows.get(&q.record.id).is_some());

        let mut outcome = FlushOutcome {
            sent: known.len() + fresh.len(),
            ..FlushOutcome::default()
        };
        let mut deferred = Vec::new();
        let mut failure = None;

        if !known.is_empty() {
            match self.write_updates(known).await {
                Ok(result) => {
                    outcome.updated = result.written.len();
                    self.confirm(&result.written, &mut outcome);
                    deferred.extend(result.deferred);
                }
                Err(err) => failure = Some(err),
            }
        }

        if !fresh.is_empty() {
            match self.write_appends(fresh).await {
                Ok(result) => {
                    outcome.appended = result.written.len();
                    self.confirm(&result.written, &mut outcome);
                    deferred.extend(result.deferred);
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        outcome.deferred = deferred.len();
        self.requeue(deferred);

        match failure {
            Some(err) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            None => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(outcome)
            }
        }
    }

    async fn flush_logged(&self, trigger: &'static str) {
        match self.flush().await {
            Ok(outcome) if outcome.sent > 0 => debug!(
                trigger,
                sent = outcome.sent,
                updated = outcome.updated,
                appended = outcome.appended,
                confirmed = outcome.confirmed,
                superseded = outcome.superseded,
                "batch flushed"
            ),
            Ok(_) => {}
            Err(err) => warn!(trigger, error = %err, "batch flush failed, records stay pending"),
        }
    }

    /// Overwrite existing rows. Addresses are resolved when the job runs.
    async fn write_updates(&self, batch: Vec<Queued>) -> SyncResult<Written> {
        let ctx = self.ctx.clone();
        let batch = Arc::new(batch);
        let name = format!("update_ranges[{}]", batch.len());
        self.ctx
            .scheduler
            .submit(name, move || {
                let ctx = ctx.clone();
                let batch = Arc::clone(&batch);
                async move {
                    let mut result = Written::default();
                    let mut updates = Vec::new();
                    for queued in batch.iter() {
                        let id = &queued.record.id;
                        match ctx.rows.get(id) {
                            Some(row) if ctx.store.contains(id) => {
                                updates.push(RangeUpdate::new(row, row::encode(&queued.record)));
                                result.written.push(queued.clone());
                            }
                            _ => result.deferred.push(queued.clone()),
                        }
                    }
                    if !updates.is_empty() {
                        ctx.backend.update_ranges(updates).await?;
                    }
                    Ok(result)
                }
            })
            .await
    }

    /// Append records with no row yet and index where they landed.
    async fn write_appends(&self, batch: Vec<Queued>) -> SyncResult<Written> {
        let ctx = self.ctx.clone();
        let batch = Arc::new(batch);
        let name = format!("append_rows[{}]", batch.len());
        self.ctx
            .scheduler
            .submit(name, move || {
                let ctx = ctx.clone();
                let batch = Arc::clone(&batch);
                async move {
                    let mut result = Written::default();
                    let mut rows: Vec<RawRow> = Vec::new();
                    for queued in batch.iter() {
                        let id = &queued.record.id;
                        if ctx.store.contains(id) && ctx.rows.get(id).is_none() {
                            rows.push(row::encode(&queued.record));
                            result.written.push(queued.clone());
                        } else {
                            result.deferred.push(queued.clone());
                        }
                    }
                    if rows.is_empty() {
                        return Ok(result);
                    }

                    let addresses = ctx.backend.append_rows(rows).await?;
                    if addresses.len() != result.written.len() {
                        warn!(
                            sent = result.written.len(),
                            acknowledged = addresses.len(),
                            "append acknowledged a different number of rows"
                        );
                    }
                    for (queued, address) in result.written.iter().zip(addresses) {
                        ctx.rows.assign(queued.record.id.clone(), address);
                    }
                    Ok(result)
                }
            })
            .await
    }

    /// Clear the pending flag of records whose sent stamp is still current.
    fn confirm(&self, written: &[Queued], outcome: &mut FlushOutcome) {
        let now = now_millis();
        for queued in written {
            if self
                .ctx
                .store
                .confirm_synced(&queued.record.id, queued.stamp, now)
            {
                outcome.confirmed += 1;
            } else {
                outcome.superseded += 1;
            }
        }
        self.counters
            .records_written
            .fetch_add(written.len() as u64, Ordering::Relaxed);
    }

    /// Queue deferred records again if they are still pending.
    fn requeue(&self, deferred: Vec<Queued>) {
        let mut requeued = 0;
        for queued in deferred {
            if let Some(entry) = self.ctx.store.entry(&queued.record.id) {
                if entry.sync.pending {
                    self.enqueue(entry.record, entry.sync.last_local_change);
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            self.signal(Signal::Kick);
        }
    }
}

async fn debounce(
    shared: Arc<BatchShared>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    delay: Duration,
) {
    'signals: while let Some(mut signal) = signals.recv().await {
        while signal == Signal::Kick {
            tokio::select! {
                next = signals.recv() => match next {
                    Some(next) => signal = next,
                    None => break 'signals,
                },
                () = sleep(delay) => break,
            }
        }
        let trigger = match signal {
            Signal::Flush => "size",
            Signal::Kick => "debounce",
        };
        shared.flush_logged(trigger).await;
    }
    shared.flush_logged("shutdown").await;
}
