//! LocalStore - the authoritative in-memory record table.
//!
//! The store holds every live record with its [`SyncState`], plus a tombstone
//! for each record deleted locally whose remote delete has not been confirmed.
//! Records and tombstones share one sharded map, so every operation on an id
//! is linearizable without a global lock across ids.

use crate::{
    error::Result, snapshot::StoreSnapshot, ChangeClock, Error, Record, RecordId, StoredRecord,
    SyncState, Timestamp,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// State of one id in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Live(StoredRecord),
    /// Deleted locally; remote delete not yet confirmed
    Deleted { at: Timestamp },
}

impl Slot {
    fn live(&self) -> Option<&StoredRecord> {
        match self {
            Slot::Live(stored) => Some(stored),
            Slot::Deleted { .. } => None,
        }
    }

    /// Overwrite with a locally changed record.
    fn write_local(&mut self, record: Record, stamp: Timestamp) {
        match self {
            Slot::Live(stored) => {
                stored.record = record;
                stored.sync.pending = true;
                stored.sync.last_local_change = stamp;
            }
            Slot::Deleted { .. } => {
                *self = Slot::Live(StoredRecord {
                    record,
                    sync: SyncState::changed(stamp),
                });
            }
        }
    }
}

/// Result of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The stored value already equalled the write; nothing changed
    Unchanged,
    /// The record changed and is now pending with this change stamp
    Changed(Timestamp),
}

impl Upsert {
    /// The new change stamp, if the write changed anything.
    pub fn stamp(self) -> Option<Timestamp> {
        match self {
            Upsert::Changed(stamp) => Some(stamp),
            Upsert::Unchanged => None,
        }
    }
}

/// Result of adopting a record read from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adopt {
    /// The id was unknown locally and is now stored
    Inserted,
    /// A confirmed local copy was replaced by the remote one
    Replaced,
    /// The confirmed local copy already matched
    Unchanged,
    /// The local copy has unconfirmed changes and was kept
    KeptPending,
    /// The id was deleted locally; the remote copy was ignored
    Tombstoned,
}

/// The in-memory record table.
///
/// Constructed once per process and shared by `Arc` with the sync layer and
/// the CRUD handlers.
#[derive(Debug, Default)]
pub struct LocalStore {
    slots: DashMap<RecordId, Slot>,
    clock: ChangeClock,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            clock: ChangeClock::new(),
        }
    }

    /// The clock stamping local changes.
    pub fn clock(&self) -> &ChangeClock {
        &self.clock
    }

    /// Get a live record by id.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.slots
            .get(id)
            .and_then(|slot| slot.live().map(|s| s.record.clone()))
    }

    /// Get a live record together with its sync state.
    pub fn entry(&self, id: &str) -> Option<StoredRecord> {
        self.slots.get(id).and_then(|slot| slot.live().cloned())
    }

    /// Check if a live record exists under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.slots.get(id).is_some_and(|slot| slot.live().is_some())
    }

    /// All live records, ordered by registration time then id.
    pub fn list(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .slots
            .iter()
            .filter_map(|slot| slot.live().map(|s| s.record.clone()))
            .collect();
        records.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// All live records with sync state, ordered by id.
    pub fn entries(&self) -> Vec<StoredRecord> {
        let mut entries: Vec<StoredRecord> = self
            .slots
            .iter()
            .filter_map(|slot| slot.live().cloned())
            .collect();
        entries.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        entries
    }

    /// Count of live records.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live().is_some()).count()
    }

    /// Check if the store has no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite a record as a local change.
    ///
    /// Writing a value equal to the stored one is a no-op: the record keeps
    /// its sync state and no new change stamp is issued.
    pub fn upsert(&self, record: Record, now: Timestamp) -> Result<Upsert> {
        validate(&record)?;

        let stamp = match self.slots.entry(record.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let Slot::Live(stored) = slot {
                    if stored.record == record {
                        return Ok(Upsert::Unchanged);
                    }
                }
                let stamp = self.clock.tick(now);
                slot.write_local(record, stamp);
                stamp
            }
            Entry::Vacant(vacant) => {
                let stamp = self.clock.tick(now);
                vacant.insert(Slot::Live(StoredRecord {
                    record,
                    sync: SyncState::changed(stamp),
                }));
                stamp
            }
        };

        Ok(Upsert::Changed(stamp))
    }

    /// Read-modify-write a live record under its lock.
    ///
    /// Concurrent updates of the same id (duplicate scans) are applied one
    /// after the other, each seeing the previous result.
    pub fn update<F>(&self, id: &str, now: Timestamp, f: F) -> Result<(Record, Upsert)>
    where
        F: FnOnce(&Record) -> Result<Record>,
    {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        let Slot::Live(stored) = slot.value_mut() else {
            return Err(Error::RecordNotFound(id.to_string()));
        };

        let mut next = f(&stored.record)?;
        next.id = stored.record.id.clone();
        validate(&next)?;

        if next == stored.record {
            return Ok((next, Upsert::Unchanged));
        }

        let stamp = self.clock.tick(now);
        stored.record = next.clone();
        stored.sync.pending = true;
        stored.sync.last_local_change = stamp;
        Ok((next, Upsert::Changed(stamp)))
    }

    /// Remove a live record, leaving a tombstone until the remote delete is
    /// confirmed. Returns `None` if the id is not live.
    pub fn remove(&self, id: &str, now: Timestamp) -> Option<Record> {
        let mut slot = self.slots.get_mut(id)?;
        match std::mem::replace(slot.value_mut(), Slot::Deleted { at: now }) {
            Slot::Live(stored) => Some(stored.record),
            deleted => {
                *slot.value_mut() = deleted;
                None
            }
        }
    }

    /// Set or clear the pending flag, returning the record's change stamp.
    ///
    /// Marking a confirmed record pending issues a new stamp, so an older
    /// in-flight write can never confirm it.
    pub fn set_pending(&self, id: &str, pending: bool, now: Timestamp) -> Result<Timestamp> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        let Slot::Live(stored) = slot.value_mut() else {
            return Err(Error::RecordNotFound(id.to_string()));
        };

        if pending && !stored.sync.pending {
            stored.sync.last_local_change = self.clock.tick(now);
        }
        stored.sync.pending = pending;
        Ok(stored.sync.last_local_change)
    }

    /// All pending records with their change stamps, ordered by id.
    pub fn pending_records(&self) -> Vec<(Record, Timestamp)> {
        let mut pending: Vec<(Record, Timestamp)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.live()
                    .filter(|s| s.sync.pending)
                    .map(|s| (s.record.clone(), s.sync.last_local_change))
            })
            .collect();
        pending.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        pending
    }

    /// Count of pending records.
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.live().is_some_and(|s| s.sync.pending))
            .count()
    }

    /// Clear the pending flag after the remote accepted the values sent with
    /// change stamp `sent`.
    ///
    /// Returns false (and leaves the record pending) if the record changed
    /// again after that stamp, or no longer exists.
    pub fn confirm_synced(&self, id: &str, sent: Timestamp, at: Timestamp) -> bool {
        let Some(mut slot) = self.slots.get_mut(id) else {
            return false;
        };
        match slot.value_mut() {
            Slot::Live(stored) if stored.sync.last_local_change == sent => {
                stored.sync.pending = false;
                stored.sync.last_confirmed_remote_write = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Adopt a record read from the remote.
    ///
    /// Never overwrites a record with unconfirmed local changes and never
    /// resurrects a tombstoned id.
    pub fn adopt_remote(&self, record: Record, now: Timestamp) -> Adopt {
        match self.slots.entry(record.id.clone()) {
            Entry::Vacant(vacant) => {
                let stamp = self.clock.tick(now);
                vacant.insert(Slot::Live(StoredRecord {
                    record,
                    sync: SyncState::confirmed(stamp, now),
                }));
                Adopt::Inserted
            }
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Deleted { .. } => Adopt::Tombstoned,
                Slot::Live(stored) if stored.sync.pending => Adopt::KeptPending,
                Slot::Live(stored) if stored.record == record => {
                    stored.sync.last_confirmed_remote_write = Some(now);
                    Adopt::Unchanged
                }
                Slot::Live(stored) => {
                    let stamp = self.clock.tick(now);
                    stored.record = record;
                    stored.sync = SyncState::confirmed(stamp, now);
                    Adopt::Replaced
                }
            },
        }
    }

    /// Replace all confirmed state with `records`, as read from the remote.
    ///
    /// Records with unconfirmed local changes are kept, so a write racing a
    /// bootstrap is never lost. Returns the number of records stored.
    pub fn replace_all(&self, records: impl IntoIterator<Item = Record>, now: Timestamp) -> usize {
        self.slots
            .retain(|_, slot| slot.live().is_some_and(|s| s.sync.pending));
        let mut stored = 0;
        for record in records {
            if matches!(
                self.adopt_remote(record, now),
                Adopt::Inserted | Adopt::Replaced
            ) {
                stored += 1;
            }
        }
        stored
    }

    /// Check if an id is deleted locally with the remote delete outstanding.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| matches!(*slot, Slot::Deleted { .. }))
    }

    /// Ids of all tombstones, ordered.
    pub fn tombstones(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Deleted { .. }))
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop the tombstone for an id once the remote no longer has the row.
    pub fn clear_tombstone(&self, id: &str) -> bool {
        self.slots
            .remove_if(id, |_, slot| matches!(slot, Slot::Deleted { .. }))
            .is_some()
    }

    /// Export the current store state as a snapshot.
    pub fn export_state(&self, now: Timestamp) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(now);
        snapshot.clock = self.clock.high_water();

        for slot in self.slots.iter() {
            match slot.value() {
                Slot::Live(stored) => snapshot.add_record(stored.clone()),
                Slot::Deleted { at } => snapshot.add_tombstone(slot.key().clone(), *at),
            }
        }

        snapshot
    }

    /// Replace the current state with a snapshot's state.
    pub fn import_state(&self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate()?;

        self.slots.clear();
        self.clock.observe(snapshot.clock);

        for (id, stored) in snapshot.records {
            self.clock.observe(stored.sync.last_local_change);
            self.slots.insert(id, Slot::Live(stored));
        }
        for (id, at) in snapshot.tombstones {
            self.slots.insert(id, Slot::Deleted { at });
        }

        Ok(())
    }
}

fn validate(record: &Record) -> Result<()> {
    if record.id.trim().is_empty() {
        return Err(Error::MissingRequiredField("id".into()));
    }
    if record.name.trim().is_empty() {
        return Err(Error::MissingRequiredField("name".into()));
    }
    Ok(())
}
