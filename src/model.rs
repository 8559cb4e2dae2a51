use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unix milliseconds.
pub type Ms = i64;

/// Externally assigned, stable table identifier.
pub type TableId = u32;

/// A guest-list entry. Owned by the table the guest is reserved at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub name: String,
    pub table_id: TableId,
    /// Entourage size. Declared at reservation, replaced by the actual entourage on arrival.
    pub accompanying_guests: u32,
    /// Party size (guest + entourage) while arrived, 0 otherwise.
    pub num_arrived: u32,
    pub time_arrived: Option<Ms>,
}

impl GuestRecord {
    pub fn new(name: String, table_id: TableId, accompanying_guests: u32) -> Self {
        Self {
            name,
            table_id,
            accompanying_guests,
            num_arrived: 0,
            time_arrived: None,
        }
    }

    /// Seats this guest holds in the table's reservation count.
    pub fn party_size(&self) -> u32 {
        self.accompanying_guests + 1
    }

    pub fn is_arrived(&self) -> bool {
        self.num_arrived > 0
    }

    pub fn status(&self) -> GuestStatus {
        if self.is_arrived() {
            GuestStatus::Arrived
        } else {
            GuestStatus::Reserved
        }
    }
}

/// Derived guest state. A guest with no record is simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    Reserved,
    Arrived,
}

impl GuestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            GuestStatus::Reserved => "reserved",
            GuestStatus::Arrived => "arrived",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub id: TableId,
    pub capacity: u32,
    pub num_reserved: u32,
    pub num_occupied: u32,
    /// Guests reserved at this table, keyed by name.
    pub guests: BTreeMap<String, GuestRecord>,
}

impl TableState {
    pub fn new(id: TableId, capacity: u32) -> Self {
        Self {
            id,
            capacity,
            num_reserved: 0,
            num_occupied: 0,
            guests: BTreeMap::new(),
        }
    }

    pub fn empty_seats(&self) -> u32 {
        self.capacity.saturating_sub(self.num_occupied)
    }

    /// Sum of party sizes over every guest reserved here.
    pub fn reserved_sum(&self) -> u64 {
        self.guests.values().map(|g| u64::from(g.party_size())).sum()
    }

    /// Sum of arrived party sizes.
    pub fn occupied_sum(&self) -> u64 {
        self.guests.values().map(|g| u64::from(g.num_arrived)).sum()
    }

    pub fn guest_info(&self, name: &str) -> Option<GuestInfo> {
        self.guests.get(name).map(GuestInfo::from)
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            table_id: self.id,
            capacity: self.capacity,
            num_reserved: self.num_reserved,
            num_occupied: self.num_occupied,
        }
    }
}

/// WAL record format. Flat, no nesting.
///
/// Guest events carry the table's counters *after* the transition, so the
/// guest change and the counter change are one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TableProvisioned {
        table_id: TableId,
        capacity: u32,
    },
    GuestReserved {
        name: String,
        table_id: TableId,
        accompanying_guests: u32,
        num_reserved: u32,
    },
    GuestArrived {
        name: String,
        table_id: TableId,
        accompanying_guests: u32,
        num_arrived: u32,
        time_arrived: Ms,
        num_reserved: u32,
        num_occupied: u32,
    },
    GuestDeparted {
        name: String,
        table_id: TableId,
        num_occupied: u32,
    },
    /// Full table image written by compaction.
    TableSnapshot {
        table_id: TableId,
        capacity: u32,
        num_reserved: u32,
        num_occupied: u32,
        guests: Vec<GuestRecord>,
    },
}

impl Event {
    pub fn table_id(&self) -> TableId {
        match self {
            Event::TableProvisioned { table_id, .. }
            | Event::GuestReserved { table_id, .. }
            | Event::GuestArrived { table_id, .. }
            | Event::GuestDeparted { table_id, .. }
            | Event::TableSnapshot { table_id, .. } => *table_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table_id: TableId,
    pub capacity: u32,
    pub num_reserved: u32,
    pub num_occupied: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub name: String,
    pub table_id: TableId,
    pub accompanying_guests: u32,
    pub num_arrived: u32,
    pub time_arrived: Option<Ms>,
}

impl GuestInfo {
    pub fn status(&self) -> GuestStatus {
        if self.num_arrived > 0 {
            GuestStatus::Arrived
        } else {
            GuestStatus::Reserved
        }
    }
}

impl From<&GuestRecord> for GuestInfo {
    fn from(g: &GuestRecord) -> Self {
        Self {
            name: g.name.clone(),
            table_id: g.table_id,
            accompanying_guests: g.accompanying_guests,
            num_arrived: g.num_arrived,
            time_arrived: g.time_arrived,
        }
    }
}

/// Row of the guest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestListEntry {
    pub name: String,
    pub table_id: TableId,
    pub accompanying_guests: u32,
}

/// Row of the arrived-guests report. `accompanying_guests` is the arrived party minus the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivedGuestEntry {
    pub name: String,
    pub accompanying_guests: u32,
    pub time_arrived: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    ReservedOverCapacity,
    OccupiedOverCapacity,
    ReservedSumMismatch,
    OccupiedSumMismatch,
}

impl ViolationKind {
    pub fn label(&self) -> &'static str {
        match self {
            ViolationKind::ReservedOverCapacity => "reserved_over_capacity",
            ViolationKind::OccupiedOverCapacity => "occupied_over_capacity",
            ViolationKind::ReservedSumMismatch => "reserved_sum_mismatch",
            ViolationKind::OccupiedSumMismatch => "occupied_sum_mismatch",
        }
    }
}

/// A table whose counters disagree with its bounds or with its guest records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub table_id: TableId,
    pub kind: ViolationKind,
    pub expected: u64,
    pub actual: u64,
}
