use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::admission::{
    now_ms, plan_arrival, plan_departure, plan_reservation, validate_accompanying, validate_name,
};
use super::{Engine, EngineError, SharedTableState, WalCommand};

impl Engine {
    /// Out-of-band table creation. Counters start at zero.
    pub async fn provision_table(&self, table_id: TableId, capacity: u32) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidInput("capacity must be positive"));
        }
        if capacity > MAX_TABLE_CAPACITY {
            return Err(EngineError::InvalidInput("capacity too large"));
        }

        let _provisioning = self.provision_lock.lock().await;
        if self.store.contains_table(&table_id) {
            return Err(EngineError::TableExists(table_id));
        }
        if self.store.table_count() >= MAX_TABLES {
            return Err(EngineError::LimitExceeded("too many tables"));
        }

        let event = Event::TableProvisioned { table_id, capacity };
        self.wal_append(&event).await?;
        let ts = TableState::new(table_id, capacity);
        self.store.insert_table(table_id, Arc::new(RwLock::new(ts)));
        info!("INSERT table {table_id} | capacity: {capacity}");
        Ok(())
    }

    /// Add a guest and their entourage to a table's reservation list.
    pub async fn reserve(
        &self,
        name: &str,
        table_id: TableId,
        accompanying_guests: u32,
    ) -> Result<GuestInfo, EngineError> {
        validate_name(name)?;
        validate_accompanying(accompanying_guests)?;

        // Claim the name first: a taken name is AlreadyReserved whichever table
        // the request targets, and the guest cap is checked under the same claim.
        let claim = self.store.claim_guest(name, table_id, MAX_GUESTS)?;
        let table = self
            .store
            .get_table(&table_id)
            .ok_or(EngineError::UnknownTable(table_id))?;

        let mut guard = table.write().await;
        let plan = plan_reservation(&guard, name, accompanying_guests)?;
        let event = Event::GuestReserved {
            name: name.to_string(),
            table_id,
            accompanying_guests,
            num_reserved: plan.num_reserved,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();

        info!(
            "INSERT guest {name} | table: {table_id} | accompanying_guests: {accompanying_guests} | num_reserved: {}",
            guard.num_reserved
        );
        guard
            .guest_info(name)
            .ok_or_else(|| EngineError::NoReservation(name.to_string()))
    }

    /// Mark a reserved guest as arrived with the entourage they actually brought.
    pub async fn arrive(&self, name: &str, accompanying_guests: u32) -> Result<GuestInfo, EngineError> {
        validate_accompanying(accompanying_guests)?;
        let mut guard = self.resolve_guest_write(name).await?;
        let plan = plan_arrival(&guard, name, accompanying_guests)?;
        let time_arrived = now_ms();
        let event = Event::GuestArrived {
            name: name.to_string(),
            table_id: guard.id,
            accompanying_guests: plan.accompanying_guests,
            num_arrived: plan.num_arrived,
            time_arrived,
            num_reserved: plan.num_reserved,
            num_occupied: plan.num_occupied,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        info!(
            "UPDATE guest {name} | num_arrived: {} | time_arrived: {time_arrived} | table: {} | num_reserved: {} | num_occupied: {}",
            plan.num_arrived, guard.id, guard.num_reserved, guard.num_occupied
        );
        guard
            .guest_info(name)
            .ok_or_else(|| EngineError::NoReservation(name.to_string()))
    }

    /// Mark an arrived guest as gone. Their reservation stays on the list.
    pub async fn depart(&self, name: &str) -> Result<(), EngineError> {
        let mut guard = self.resolve_guest_write(name).await?;
        let plan = plan_departure(&guard, name)?;
        let event = Event::GuestDeparted {
            name: name.to_string(),
            table_id: guard.id,
            num_occupied: plan.num_occupied,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        info!(
            "UPDATE guest {name} | num_arrived: 0 | freed: {} | table: {} | num_occupied: {}",
            plan.freed, guard.id, guard.num_occupied
        );
        Ok(())
    }

    /// Rewrite the WAL as one snapshot event per table.
    ///
    /// Holds every table's read lock (and the provisioning lock) until the
    /// writer has swapped the file, so no committed transition can fall
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _provisioning = self.provision_lock.lock().await;
        let tables: Vec<SharedTableState> = self
            .store
            .tables_in_order()
            .into_iter()
            .map(|(_, table)| table)
            .collect();

        let mut guards = Vec::with_capacity(tables.len());
        for table in &tables {
            guards.push(table.read().await);
        }

        let events: Vec<Event> = guards
            .iter()
            .map(|ts| Event::TableSnapshot {
                table_id: ts.id,
                capacity: ts.capacity,
                num_reserved: ts.num_reserved,
                num_occupied: ts.num_occupied,
                guests: ts.guests.values().cloned().collect(),
            })
            .collect();
        let table_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

        info!("compacted WAL to {table_count} table snapshots");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
