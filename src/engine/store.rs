use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::*;

use super::{EngineError, SharedTableState};

/// Table map plus the venue-wide guest name index.
///
/// Guest records themselves live inside their table's state; the index only
/// answers "which table is this name reserved at".
pub struct VenueStore {
    tables: DashMap<TableId, SharedTableState>,
    guest_index: DashMap<String, TableId>,
    /// Index entries, claims included. Only moves under a shard lock.
    guest_total: AtomicUsize,
}

impl Default for VenueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VenueStore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            guest_index: DashMap::new(),
            guest_total: AtomicUsize::new(0),
        }
    }

    // ── Tables ───────────────────────────────────────────────

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn contains_table(&self, id: &TableId) -> bool {
        self.tables.contains_key(id)
    }

    pub fn get_table(&self, id: &TableId) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    pub fn insert_table(&self, id: TableId, state: SharedTableState) {
        self.tables.insert(id, state);
    }

    /// All tables, ordered by id. Handles are cloned out so no shard lock
    /// is held while the caller awaits on them.
    pub fn tables_in_order(&self) -> Vec<(TableId, SharedTableState)> {
        let mut tables: Vec<_> = self
            .tables
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        tables.sort_by_key(|(id, _)| *id);
        tables
    }

    // ── Guest name index ─────────────────────────────────────

    pub fn guest_count(&self) -> usize {
        self.guest_total.load(Ordering::Acquire)
    }

    pub fn table_for_guest(&self, name: &str) -> Option<TableId> {
        self.guest_index.get(name).map(|e| *e.value())
    }

    /// Atomically claim `name` for `table_id` while fewer than `max_guests`
    /// names are indexed. The claim is released on drop unless committed.
    pub fn claim_guest(
        &self,
        name: &str,
        table_id: TableId,
        max_guests: usize,
    ) -> Result<GuestClaim<'_>, EngineError> {
        match self.guest_index.entry(name.to_string()) {
            Entry::Occupied(_) => Err(EngineError::AlreadyReserved(name.to_string())),
            Entry::Vacant(slot) => {
                self.guest_total
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max_guests).then_some(n + 1)
                    })
                    .map_err(|_| EngineError::LimitExceeded("too many guests"))?;
                slot.insert(table_id);
                Ok(GuestClaim {
                    store: self,
                    name: name.to_string(),
                    committed: false,
                })
            }
        }
    }

    /// Unconditional index write, used when rebuilding from the WAL.
    pub fn index_guest(&self, name: String, table_id: TableId) {
        if self.guest_index.insert(name, table_id).is_none() {
            self.guest_total.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn release_guest(&self, name: &str) {
        if self.guest_index.remove(name).is_some() {
            self.guest_total.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A pending name reservation in the guest index.
pub struct GuestClaim<'a> {
    store: &'a VenueStore,
    name: String,
    committed: bool,
}

impl GuestClaim<'_> {
    /// Keep the index entry; the guest record has been committed.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for GuestClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.release_guest(&self.name);
        }
    }
}
