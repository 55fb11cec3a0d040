//! Edge case tests for checkin-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use checkin_engine::{
    row, Adopt, ChangeClock, LocalStore, NewRecord, Reconciler, Record, RecordPatch, RowAddress,
    RowOutcome, StoreSnapshot, Upsert,
};
use std::sync::Arc;

fn attendee(id: &str, name: &str) -> Record {
    NewRecord::new(name)
        .with_email(format!("{id}@example.com"))
        .into_record(id, 1_706_745_600_000)
        .unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_names_survive_the_row_codec() {
    let names = vec![
        "José Ñúñez",
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Tab\tSeparated",
    ];

    for (i, name) in names.iter().enumerate() {
        let record = attendee(&format!("att-{i}"), name);
        let cells = row::encode(&record);
        let decoded = row::decode(RowAddress::for_index(i), &cells).unwrap();
        assert_eq!(decoded, RowOutcome::Record(record), "failed for: {name}");
    }
}

#[test]
fn very_long_strings() {
    let store = LocalStore::new();
    let long_name = "x".repeat(1024 * 1024);

    store.upsert(attendee("att-1", &long_name), 1000).unwrap();
    assert_eq!(store.get("att-1").unwrap().name.len(), 1024 * 1024);
}

#[test]
fn whitespace_only_name_is_rejected_everywhere() {
    assert!(NewRecord::new(" \t ").into_record("att-1", 0).is_err());

    let store = LocalStore::new();
    assert!(store.upsert(Record::new("att-1", "  ", 0), 0).is_err());

    let cells = vec!["att-1".to_string(), "   ".to_string()];
    assert!(row::decode(RowAddress(2), &cells).is_err());
}

#[test]
fn extra_cells_are_ignored() {
    let mut cells = row::encode(&attendee("att-1", "Ada"));
    cells.push("notes someone typed".into());
    cells.push("more".into());

    let decoded = row::decode(RowAddress(2), &cells).unwrap();
    assert_eq!(decoded, RowOutcome::Record(attendee("att-1", "Ada")));
    assert_eq!(row::padded(&cells).len(), row::COLUMNS.len());
}

// ============================================================================
// Timestamp Edge Cases
// ============================================================================

#[test]
fn epoch_and_far_future_timestamps() {
    for ts in [0u64, 1, 4_102_444_800_000] {
        let mut record = Record::new("att-1", "Ada", ts);
        record.mark_present(ts);
        let decoded = row::decode(RowAddress(2), &row::encode(&record)).unwrap();
        assert_eq!(decoded, RowOutcome::Record(record));
    }
}

#[test]
fn clock_high_values() {
    let clock = ChangeClock::starting_at(u64::MAX - 2);
    assert_eq!(clock.tick(0), u64::MAX - 1);
    assert_eq!(clock.tick(0), u64::MAX);
}

// ============================================================================
// Idempotency
// ============================================================================

#[test]
fn repeated_check_in_is_a_noop() {
    let store = LocalStore::new();
    store.upsert(attendee("att-1", "Ada"), 1000).unwrap();

    let (_, first) = store
        .update("att-1", 2000, |r| {
            let mut next = r.clone();
            next.mark_present(2000);
            Ok(next)
        })
        .unwrap();
    let (record, second) = store
        .update("att-1", 3000, |r| {
            let mut next = r.clone();
            next.mark_present(3000);
            Ok(next)
        })
        .unwrap();

    assert!(matches!(first, Upsert::Changed(_)));
    assert_eq!(second, Upsert::Unchanged);
    assert_eq!(record.present_at, Some(2000));
}

#[test]
fn empty_patch_changes_nothing() {
    let store = LocalStore::new();
    store.upsert(attendee("att-1", "Ada"), 1000).unwrap();

    let (_, outcome) = store
        .update("att-1", 2000, |r| RecordPatch::default().apply(r, 2000))
        .unwrap();
    assert_eq!(outcome, Upsert::Unchanged);
}

#[test]
fn concurrent_duplicate_scans_check_in_once() {
    let store = Arc::new(LocalStore::new());
    store.upsert(attendee("att-1", "Ada"), 1000).unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .update("att-1", 2000 + i, |r| {
                        let mut next = r.clone();
                        next.mark_present(2000 + i);
                        Ok(next)
                    })
                    .unwrap()
                    .1
            })
        })
        .collect();

    let changed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|outcome| matches!(outcome, Upsert::Changed(_)))
        .count();
    assert_eq!(changed, 1);
}

// ============================================================================
// Deletion
// ============================================================================

#[test]
fn recreating_a_deleted_id_revives_it_as_pending() {
    let store = LocalStore::new();
    store.upsert(attendee("att-1", "Ada"), 1000).unwrap();
    store.remove("att-1", 1500);

    store.upsert(attendee("att-1", "Ada"), 2000).unwrap();
    assert!(!store.is_tombstoned("att-1"));
    assert!(store.entry("att-1").unwrap().sync.pending);
}

#[test]
fn tombstone_blocks_stale_pull() {
    let store = LocalStore::new();
    store.adopt_remote(attendee("att-1", "Ada"), 1000);
    store.remove("att-1", 2000);

    let mut reconciler = Reconciler::new();
    reconciler.load_local(store.entries());
    reconciler.load_tombstones(store.tombstones());
    let plan = reconciler.reconcile(&[row::encode(&attendee("att-1", "Ada"))]);

    assert!(plan.adopt.is_empty());
    assert_eq!(plan.reissue_deletes, vec!["att-1".to_string()]);
    assert_eq!(
        store.adopt_remote(attendee("att-1", "Ada"), 3000),
        Adopt::Tombstoned
    );
    assert!(store.get("att-1").is_none());
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn empty_store_snapshot() {
    let store = LocalStore::new();
    let json = store.export_state(1000).to_json().unwrap();

    let restored = LocalStore::new();
    restored
        .import_state(StoreSnapshot::from_json(&json).unwrap())
        .unwrap();
    assert!(restored.is_empty());
}

#[test]
fn import_replaces_existing_state() {
    let source = LocalStore::new();
    source.upsert(attendee("att-1", "Ada"), 1000).unwrap();
    let snapshot = source.export_state(2000);

    let target = LocalStore::new();
    target.upsert(attendee("att-9", "Zed"), 1000).unwrap();
    target.import_state(snapshot).unwrap();

    assert!(target.get("att-9").is_none());
    assert!(target.get("att-1").is_some());
}

#[test]
fn stamps_continue_after_import() {
    let source = LocalStore::new();
    let stamp = source
        .upsert(attendee("att-1", "Ada"), 9_000_000)
        .unwrap()
        .stamp()
        .unwrap();

    let target = LocalStore::new();
    target.import_state(source.export_state(0)).unwrap();

    let (_, outcome) = target
        .update("att-1", 1, |r| {
            let mut next = r.clone();
            next.mark_printed(1);
            Ok(next)
        })
        .unwrap();
    assert!(outcome.stamp().unwrap() > stamp);
}
