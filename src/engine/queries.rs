use tracing::warn;

use crate::model::*;

use super::Engine;

impl Engine {
    /// Seats not currently occupied, summed over every table.
    pub async fn empty_seats(&self) -> u64 {
        let mut total = 0u64;
        for (table_id, table) in self.store.tables_in_order() {
            let guard = table.read().await;
            if guard.num_occupied > guard.capacity {
                warn!(
                    "table {table_id}: {} occupied exceeds capacity {}",
                    guard.num_occupied, guard.capacity
                );
            }
            total += u64::from(guard.empty_seats());
        }
        total
    }

    /// Arrived guests ordered by name, with the entourage they arrived with.
    pub async fn arrived_guests(&self) -> Vec<ArrivedGuestEntry> {
        let mut arrived = Vec::new();
        for (_, table) in self.store.tables_in_order() {
            let guard = table.read().await;
            arrived.extend(guard.guests.values().filter_map(|g| {
                let time_arrived = g.time_arrived?;
                g.is_arrived().then(|| ArrivedGuestEntry {
                    name: g.name.clone(),
                    accompanying_guests: g.num_arrived - 1,
                    time_arrived,
                })
            }));
        }
        arrived.sort_by(|a, b| a.name.cmp(&b.name));
        arrived
    }

    /// The whole guest list ordered by name.
    pub async fn all_guests(&self) -> Vec<GuestListEntry> {
        let mut guests = Vec::new();
        for (_, table) in self.store.tables_in_order() {
            let guard = table.read().await;
            guests.extend(guard.guests.values().map(|g| GuestListEntry {
                name: g.name.clone(),
                table_id: g.table_id,
                accompanying_guests: g.accompanying_guests,
            }));
        }
        guests.sort_by(|a, b| a.name.cmp(&b.name));
        guests
    }

    pub async fn list_tables(&self) -> Vec<TableInfo> {
        let mut tables = Vec::new();
        for (_, table) in self.store.tables_in_order() {
            tables.push(table.read().await.info());
        }
        tables
    }

    pub async fn get_guest(&self, name: &str) -> Option<GuestInfo> {
        let table_id = self.store.table_for_guest(name)?;
        let table = self.store.get_table(&table_id)?;
        let guard = table.read().await;
        guard.guest_info(name)
    }

    /// Recompute both per-table sums from the guest records and compare them,
    /// and the capacity bounds, against the stored counters.
    pub async fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (table_id, table) in self.store.tables_in_order() {
            let ts = table.read().await;
            let capacity = u64::from(ts.capacity);
            let reserved = u64::from(ts.num_reserved);
            let occupied = u64::from(ts.num_occupied);

            let mut flag = |kind, expected, actual| {
                if expected != actual {
                    violations.push(InvariantViolation {
                        table_id,
                        kind,
                        expected,
                        actual,
                    });
                }
            };
            flag(ViolationKind::ReservedSumMismatch, ts.reserved_sum(), reserved);
            flag(ViolationKind::OccupiedSumMismatch, ts.occupied_sum(), occupied);

            if reserved > capacity {
                violations.push(InvariantViolation {
                    table_id,
                    kind: ViolationKind::ReservedOverCapacity,
                    expected: capacity,
                    actual: reserved,
                });
            }
            if occupied > capacity {
                violations.push(InvariantViolation {
                    table_id,
                    kind: ViolationKind::OccupiedOverCapacity,
                    expected: capacity,
                    actual: occupied,
                });
            }
        }
        if !violations.is_empty() {
            warn!("invariant audit found {} violations", violations.len());
        }
        violations
    }
}
