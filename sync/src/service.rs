//! Check-in operations for the CRUD layer.
//!
//! Every write lands in the local store first and returns immediately; the
//! sync engine mirrors it to the sheet in the background.

use crate::backend::SharedBackend;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::facade::{SyncFacade, SyncReport, SyncStats};
use checkin_engine::{
    now_millis, LocalStore, NewRecord, Record, RecordPatch, StoreSnapshot, Timestamp,
};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The check-in service.
pub struct CheckinService {
    sync: Arc<SyncFacade>,
    config: SyncConfig,
    auto_pull: Mutex<Option<JoinHandle<()>>>,
}

impl CheckinService {
    /// Create a service with an empty store. Needs a tokio runtime.
    pub fn new(backend: SharedBackend, config: SyncConfig) -> Self {
        let store = Arc::new(LocalStore::new());
        Self {
            sync: Arc::new(SyncFacade::new(store, backend, &config)),
            config,
            auto_pull: Mutex::new(None),
        }
    }

    /// Create a service, restore the snapshot named in the config if there is
    /// one, queue its pending records and start automatic pulls if configured.
    pub async fn open(backend: SharedBackend, config: SyncConfig) -> SyncResult<Self> {
        let service = Self::new(backend, config);

        if let Some(path) = service.config.snapshot_path.clone() {
            if service.restore(&path).await? {
                service.sync.retry_pending();
            }
        }
        if let Some(every) = service.config.pull_interval {
            service.start_auto_pull(every);
        }

        Ok(service)
    }

    /// The sync engine behind this service.
    pub fn sync(&self) -> &Arc<SyncFacade> {
        &self.sync
    }

    fn store(&self) -> &LocalStore {
        self.sync.store()
    }

    /// Register a new attendee under a fresh id.
    pub fn create_record(&self, fields: NewRecord) -> SyncResult<Record> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = fields.into_record(id, now_millis())?;
        self.sync.record_changed(record.clone())?;
        debug!(record_id = %record.id, "attendee registered");
        Ok(record)
    }

    /// Apply a partial update.
    pub fn update_record(&self, id: &str, patch: &RecordPatch) -> SyncResult<Record> {
        let now = now_millis();
        self.modify(id, now, |record| patch.apply(record, now))
    }

    /// Check an attendee in. Checking in twice keeps the first arrival time.
    pub fn mark_present(&self, id: &str, at: Timestamp) -> SyncResult<Record> {
        self.modify(id, now_millis(), |record| {
            let mut next = record.clone();
            next.mark_present(at);
            Ok(next)
        })
    }

    /// Record that the attendee's badge was printed.
    pub fn mark_printed(&self, id: &str, at: Timestamp) -> SyncResult<Record> {
        self.modify(id, now_millis(), |record| {
            let mut next = record.clone();
            next.mark_printed(at);
            Ok(next)
        })
    }

    fn modify<F>(&self, id: &str, now: Timestamp, f: F) -> SyncResult<Record>
    where
        F: FnOnce(&Record) -> checkin_engine::error::Result<Record>,
    {
        let (record, outcome) = self.store().update(id, now, f)?;
        self.sync.track(record.clone(), outcome);
        Ok(record)
    }

    /// Delete an attendee. Returns false if the id is unknown.
    pub fn delete_record(&self, id: &str) -> bool {
        self.sync.delete(id)
    }

    /// All attendees, in registration order.
    pub fn list_records(&self) -> Vec<Record> {
        self.store().list()
    }

    pub fn get_record(&self, id: &str) -> Option<Record> {
        self.store().get(id)
    }

    /// Write queued changes, then pull.
    pub async fn force_sync(&self) -> SyncReport {
        self.sync.sync().await
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Start pulling every `every`, replacing a running schedule.
    pub fn start_auto_pull(&self, every: std::time::Duration) {
        let handle = self.sync.spawn_auto_pull(every);
        if let Some(previous) = self.auto_pull.lock().replace(handle) {
            previous.abort();
        }
        info!(every_ms = every.as_millis() as u64, "automatic pull enabled");
    }

    /// Stop automatic pulls.
    pub fn stop_auto_pull(&self) {
        if let Some(handle) = self.auto_pull.lock().take() {
            handle.abort();
        }
    }

    /// Write the store to the configured snapshot path.
    ///
    /// Returns false when no path is configured.
    pub async fn persist(&self) -> SyncResult<bool> {
        let Some(path) = self.config.snapshot_path.as_deref() else {
            return Ok(false);
        };
        let snapshot = self.store().export_state(now_millis());
        let json = snapshot.to_json_pretty()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a crash never leaves a half-written snapshot
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, json).await?;
        tokio::fs::rename(&partial, path).await?;

        info!(
            path = %path.display(),
            records = snapshot.record_count(),
            pending = snapshot.pending_count(),
            "snapshot written"
        );
        Ok(true)
    }

    /// Load a snapshot into the store. A missing file means a fresh start.
    async fn restore(&self, path: &Path) -> SyncResult<bool> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot, starting empty");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let snapshot = StoreSnapshot::from_json(&json)?;
        let records = snapshot.record_count();
        let pending = snapshot.pending_count();
        self.store().import_state(snapshot)?;

        info!(path = %path.display(), records, pending, "snapshot restored");
        Ok(true)
    }

    /// Stop background work, write what is queued and persist the store.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.stop_auto_pull();
        self.sync.shutdown().await;
        self.persist().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemorySheet;
    use crate::config::RetryPolicy;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_batch_delay(Duration::from_secs(1))
            .with_retry(RetryPolicy::no_retry())
    }

    fn service(sheet: &Arc<MemorySheet>) -> CheckinService {
        CheckinService::new(sheet.clone(), config())
    }

    #[tokio::test(start_paused = true)]
    async fn create_assigns_an_id_and_syncs() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);

        let record = service
            .create_record(NewRecord::new("  Ada Lovelace ").with_email("ada@example.com"))
            .unwrap();

        assert_eq!(record.id.len(), 36);
        assert_eq!(record.name, "Ada Lovelace");
        assert_eq!(service.sync_stats().pending_count, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sheet.record(&record.id), Some(record));
        assert_eq!(service.sync_stats().pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_rejects_a_blank_name() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);

        assert!(service.create_record(NewRecord::new("   ")).is_err());
        assert!(service.list_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_are_not_found() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);

        assert!(service.mark_present("nope", 1).unwrap_err().is_not_found());
        assert!(service.mark_printed("nope", 1).unwrap_err().is_not_found());
        assert!(service
            .update_record("nope", &RecordPatch::default())
            .unwrap_err()
            .is_not_found());
        assert!(!service.delete_record("nope"));
        assert!(service.get_record("nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn check_in_twice_keeps_first_arrival() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);
        let record = service.create_record(NewRecord::new("Ada")).unwrap();

        let first = service.mark_present(&record.id, 5_000).unwrap();
        let second = service.mark_present(&record.id, 9_000).unwrap();

        assert!(second.present);
        assert_eq!(first.present_at, Some(5_000));
        assert_eq!(second.present_at, Some(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn update_applies_a_patch() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);
        let record = service
            .create_record(NewRecord::new("Ada").with_title("Engineer"))
            .unwrap();

        let patch = RecordPatch {
            organization: Some("Analytical Engines".into()),
            title: Some(String::new()),
            ..RecordPatch::default()
        };
        let updated = service.update_record(&record.id, &patch).unwrap();

        assert_eq!(updated.organization.as_deref(), Some("Analytical Engines"));
        assert_eq!(updated.title, None);
        assert_eq!(service.get_record(&record.id), Some(updated));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkin.json");
        let sheet = Arc::new(MemorySheet::new());
        let config = config().with_snapshot_path(&path);

        let service = CheckinService::open(sheet.clone(), config.clone())
            .await
            .unwrap();
        let record = service.create_record(NewRecord::new("Ada")).unwrap();
        // Persist before the batch is written: the record is still pending
        assert!(service.persist().await.unwrap());
        assert!(path.exists());

        let reopened = CheckinService::open(Arc::new(MemorySheet::new()), config)
            .await
            .unwrap();
        assert_eq!(reopened.get_record(&record.id), Some(record));
        assert_eq!(reopened.sync_stats().pending_count, 1);
        assert_eq!(reopened.sync_stats().batch.queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_without_a_path_is_a_noop() {
        let sheet = Arc::new(MemorySheet::new());
        let service = service(&sheet);
        assert!(!service.persist().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_snapshot_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkin.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = CheckinService::open(
            Arc::new(MemorySheet::new()),
            config().with_snapshot_path(&path),
        )
        .await;
        assert!(result.is_err());
    }
}
