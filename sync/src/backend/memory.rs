//! In-memory sheet with fault injection, for tests and offline runs.

use super::{RangeUpdate, RemoteBackend};
use crate::error::{BackendError, BackendResult, ErrorClass};
use async_trait::async_trait;
use checkin_engine::row::{self, RowOutcome};
use checkin_engine::{RawRow, Record, RowAddress};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Which backend method was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    ReadAll,
    AppendRows,
    UpdateRanges,
    DeleteRow,
}

/// One call the sheet received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    /// When the call started, on the tokio clock
    pub started_at: Instant,
    /// Rows sent with the call (append and update)
    pub rows: Vec<RawRow>,
    /// Addresses the call targeted (update and delete)
    pub addresses: Vec<RowAddress>,
    /// Whether an injected fault failed the call
    pub failed: bool,
}

#[derive(Debug, Default)]
struct SheetState {
    rows: Vec<RawRow>,
    faults: VecDeque<BackendError>,
    calls: Vec<RecordedCall>,
}

/// A [`RemoteBackend`] holding its rows in memory.
///
/// Injected faults are consumed one per call, in order, before the call has
/// any effect.
#[derive(Debug, Default)]
pub struct MemorySheet {
    state: Mutex<SheetState>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySheet {
    /// An empty sheet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sheet holding these rows.
    pub fn with_rows(rows: Vec<RawRow>) -> Self {
        let sheet = Self::new();
        sheet.state.lock().rows = rows.iter().map(|r| row::padded(r)).collect();
        sheet
    }

    /// A sheet holding one row per record.
    pub fn with_records(records: &[Record]) -> Self {
        Self::with_rows(records.iter().map(row::encode).collect())
    }

    /// Make every call take `latency` before it completes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next call with `error`.
    pub fn push_fault(&self, error: BackendError) {
        self.state.lock().faults.push_back(error);
    }

    /// Fail the next `times` calls with an error of `class`.
    pub fn fail_times(&self, times: usize, class: ErrorClass) {
        let mut state = self.state.lock();
        for n in 0..times {
            state
                .faults
                .push_back(BackendError::new(class, format!("injected fault {}", n + 1)));
        }
    }

    /// Number of injected faults not consumed yet.
    pub fn pending_faults(&self) -> usize {
        self.state.lock().faults.len()
    }

    /// Current data rows.
    pub fn rows(&self) -> Vec<RawRow> {
        self.state.lock().rows.clone()
    }

    /// Replace every data row, as a bulk edit by another client would.
    pub fn set_rows(&self, rows: Vec<RawRow>) {
        self.state.lock().rows = rows;
    }

    /// Records decoded from rows that hold one.
    pub fn records(&self) -> Vec<Record> {
        self.state
            .lock()
            .rows
            .iter()
            .enumerate()
            .filter_map(
                |(i, cells)| match row::decode(RowAddress::for_index(i), cells) {
                    Ok(RowOutcome::Record(record)) => Some(record),
                    _ => None,
                },
            )
            .collect()
    }

    /// The record stored under `id`, if a row holds it.
    pub fn record(&self, id: &str) -> Option<Record> {
        self.records().into_iter().find(|r| r.id == id)
    }

    /// Write `record` the way another client would: overwrite its row, or
    /// append one if the id is not on the sheet.
    pub fn edit_record(&self, record: &Record) {
        let mut state = self.state.lock();
        let cells = row::encode(record);
        match state
            .rows
            .iter()
            .position(|r| row::row_id(r) == Some(record.id.as_str()))
        {
            Some(i) => state.rows[i] = cells,
            None => state.rows.push(cells),
        }
    }

    /// Remove the row holding `id`, as another client would.
    pub fn remove_record(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.rows.iter().position(|r| row::row_id(r) == Some(id)) {
            Some(i) => {
                state.rows.remove(i);
                true
            }
            None => false,
        }
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, kind: CallKind) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Highest number of calls that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Record the call, wait out the latency, then consume a fault if any.
    async fn begin(
        &self,
        kind: CallKind,
        rows: Vec<RawRow>,
        addresses: Vec<RowAddress>,
    ) -> BackendResult<InFlight<'_>> {
        let started_at = Instant::now();
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock();
        let fault = state.faults.pop_front();
        state.calls.push(RecordedCall {
            kind,
            started_at,
            rows,
            addresses,
            failed: fault.is_some(),
        });

        match fault {
            Some(err) => Err(err),
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl RemoteBackend for MemorySheet {
    async fn read_all(&self) -> BackendResult<Vec<RawRow>> {
        let _call = self.begin(CallKind::ReadAll, Vec::new(), Vec::new()).await?;
        Ok(self.rows())
    }

    async fn append_rows(&self, rows: Vec<RawRow>) -> BackendResult<Vec<RowAddress>> {
        let _call = self
            .begin(CallKind::AppendRows, rows.clone(), Vec::new())
            .await?;

        let mut state = self.state.lock();
        let mut addresses = Vec::with_capacity(rows.len());
        for cells in rows {
            addresses.push(RowAddress::for_index(state.rows.len()));
            state.rows.push(row::padded(&cells));
        }
        Ok(addresses)
    }

    async fn update_ranges(&self, updates: Vec<RangeUpdate>) -> BackendResult<()> {
        let _call = self
            .begin(
                CallKind::UpdateRanges,
                updates.iter().map(|u| u.values.clone()).collect(),
                updates.iter().map(|u| u.row).collect(),
            )
            .await?;

        let mut state = self.state.lock();
        let mut targets = Vec::with_capacity(updates.len());
        for update in &updates {
            let index = update.row.data_index().ok_or_else(|| {
                BackendError::from_status(400, format!("row {} is the header", update.row))
            })?;
            targets.push(index);
        }

        for (index, update) in targets.into_iter().zip(updates) {
            if index >= state.rows.len() {
                state.rows.resize(index + 1, row::padded(&[]));
            }
            state.rows[index] = row::padded(&update.values);
        }
        Ok(())
    }

    async fn delete_row(&self, row: RowAddress) -> BackendResult<()> {
        let _call = self
            .begin(CallKind::DeleteRow, Vec::new(), vec![row])
            .await?;

        let mut state = self.state.lock();
        match row.data_index() {
            Some(index) if index < state.rows.len() => {
                state.rows.remove(index);
                Ok(())
            }
            _ => Err(BackendError::from_status(
                400,
                format!("row {row} is out of range"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str) -> Record {
        Record::new(id, name, 1_000)
    }

    #[tokio::test]
    async fn append_returns_addresses_after_existing_rows() {
        let sheet = MemorySheet::with_records(&[record("a", "Ann")]);

        let addresses = sheet
            .append_rows(vec![
                row::encode(&record("b", "Bob")),
                row::encode(&record("c", "Cy")),
            ])
            .await
            .unwrap();

        assert_eq!(addresses, vec![RowAddress(3), RowAddress(4)]);
        assert_eq!(sheet.records().len(), 3);
    }

    #[tokio::test]
    async fn update_overwrites_rows() {
        let sheet = MemorySheet::with_records(&[record("a", "Ann"), record("b", "Bob")]);

        let mut bob = record("b", "Bob");
        bob.mark_present(5_000);
        sheet
            .update_ranges(vec![RangeUpdate::new(RowAddress(3), row::encode(&bob))])
            .await
            .unwrap();

        assert_eq!(sheet.record("b"), Some(bob));
        assert_eq!(sheet.record("a"), Some(record("a", "Ann")));
    }

    #[tokio::test]
    async fn update_rejects_the_header_row() {
        let sheet = MemorySheet::with_records(&[record("a", "Ann")]);

        let err = sheet
            .update_ranges(vec![RangeUpdate::new(
                RowAddress(1),
                row::encode(&record("x", "X")),
            )])
            .await
            .unwrap_err();

        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(sheet.record("a"), Some(record("a", "Ann")));
    }

    #[tokio::test]
    async fn delete_shifts_rows_up() {
        let sheet = MemorySheet::with_records(&[
            record("a", "Ann"),
            record("b", "Bob"),
            record("c", "Cy"),
        ]);

        sheet.delete_row(RowAddress(3)).await.unwrap();

        let rows = sheet.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(row::row_id(&rows[1]), Some("c"));

        let err = sheet.delete_row(RowAddress(9)).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn faults_fail_calls_without_effect() {
        let sheet = MemorySheet::new();
        sheet.fail_times(1, ErrorClass::QuotaExceeded);

        let err = sheet
            .append_rows(vec![row::encode(&record("a", "Ann"))])
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::QuotaExceeded);
        assert!(sheet.rows().is_empty());

        sheet
            .append_rows(vec![row::encode(&record("a", "Ann"))])
            .await
            .unwrap();
        assert_eq!(sheet.rows().len(), 1);

        let calls = sheet.calls_of(CallKind::AppendRows);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].failed);
        assert!(!calls[1].failed);
    }

    #[tokio::test]
    async fn edits_by_other_clients() {
        let sheet = MemorySheet::with_records(&[record("a", "Ann")]);

        sheet.edit_record(&record("a", "Ann Lee"));
        sheet.edit_record(&record("b", "Bob"));
        assert_eq!(sheet.record("a").map(|r| r.name), Some("Ann Lee".into()));
        assert_eq!(sheet.records().len(), 2);

        assert!(sheet.remove_record("a"));
        assert!(!sheet.remove_record("a"));
        assert_eq!(sheet.records().len(), 1);
        // Edits by other clients are not calls
        assert_eq!(sheet.call_count(), 0);
    }
}
