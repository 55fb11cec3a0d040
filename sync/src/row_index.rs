//! Where each record lives on the remote sheet.

use checkin_engine::{RecordId, RowAddress};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct IndexState {
    by_id: HashMap<RecordId, RowAddress>,
    row_count: usize,
    generation: u64,
    loaded: bool,
}

/// Row address of every record known to be on the sheet.
///
/// Rebuilt from every full read and kept current by our own appends and
/// deletes. Only mutated from inside scheduler jobs, so it always matches the
/// sheet as of the last call on the lane.
#[derive(Debug, Default)]
pub struct RowIndex {
    inner: RwLock<IndexState>,
}

impl RowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index after a full read of `row_count` data rows.
    pub fn replace(&self, entries: impl IntoIterator<Item = (RecordId, RowAddress)>, row_count: usize) {
        let mut state = self.inner.write();
        state.by_id = entries.into_iter().collect();
        state.row_count = row_count;
        state.generation += 1;
        state.loaded = true;
    }

    /// Address of the row holding `id`.
    pub fn get(&self, id: &str) -> Option<RowAddress> {
        self.inner.read().by_id.get(id).copied()
    }

    /// Record that `id` was appended at `row`.
    pub fn assign(&self, id: RecordId, row: RowAddress) {
        let mut state = self.inner.write();
        if let Some(index) = row.data_index() {
            state.row_count = state.row_count.max(index + 1);
        }
        state.by_id.insert(id, row);
    }

    /// Record that `row` was deleted: forget whoever lived there and move
    /// every later row up by one. Returns the id that was at `row`.
    pub fn remove_row(&self, row: RowAddress) -> Option<RecordId> {
        let mut state = self.inner.write();
        let removed = state
            .by_id
            .iter()
            .find(|(_, address)| **address == row)
            .map(|(id, _)| id.clone());
        if let Some(id) = &removed {
            state.by_id.remove(id);
        }
        for address in state.by_id.values_mut() {
            if *address > row {
                address.0 -= 1;
            }
        }
        state.row_count = state.row_count.saturating_sub(1);
        state.generation += 1;
        removed
    }

    /// Number of indexed ids.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// Data rows on the sheet, including rows without an id.
    pub fn row_count(&self) -> usize {
        self.inner.read().row_count
    }

    /// Whether a full read has filled the index yet.
    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    /// Bumped whenever existing rows may have moved.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}
