mod admission;
mod error;
mod mutations;
mod queries;
mod store;

pub use admission::{
    ArrivalPlan, DeparturePlan, ReservationPlan, plan_arrival, plan_departure, plan_reservation,
};
pub use error::EngineError;
pub use store::{GuestClaim, VenueStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;

use crate::model::*;
use crate::wal::{Wal, WalFile};

pub type SharedTableState = Arc<RwLock<TableState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the batch is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Stage and fsync the whole batch, or leave the log exactly as it was.
fn flush_batch<F: WalFile>(wal: &mut Wal<F>, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The reservation/arrival engine for one venue.
pub struct Engine {
    pub(super) store: VenueStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes table provisioning and compaction snapshots.
    pub(super) provision_lock: Mutex<()>,
}

/// Apply a guest or table event to a locked table (caller holds the lock).
fn apply_to_table(ts: &mut TableState, event: &Event) {
    match event {
        Event::GuestReserved {
            name,
            table_id,
            accompanying_guests,
            num_reserved,
        } => {
            ts.guests.insert(
                name.clone(),
                GuestRecord::new(name.clone(), *table_id, *accompanying_guests),
            );
            ts.num_reserved = *num_reserved;
        }
        Event::GuestArrived {
            name,
            accompanying_guests,
            num_arrived,
            time_arrived,
            num_reserved,
            num_occupied,
            ..
        } => {
            if let Some(guest) = ts.guests.get_mut(name) {
                guest.accompanying_guests = *accompanying_guests;
                guest.num_arrived = *num_arrived;
                guest.time_arrived = Some(*time_arrived);
            } else {
                warn!("arrival for unknown guest {name} on table {}", ts.id);
            }
            ts.num_reserved = *num_reserved;
            ts.num_occupied = *num_occupied;
        }
        Event::GuestDeparted {
            name, num_occupied, ..
        } => {
            if let Some(guest) = ts.guests.get_mut(name) {
                guest.num_arrived = 0;
                guest.time_arrived = None;
            } else {
                warn!("departure for unknown guest {name} on table {}", ts.id);
            }
            ts.num_occupied = *num_occupied;
        }
        // Table creation is handled at the store level, not here
        Event::TableProvisioned { .. } | Event::TableSnapshot { .. } => {}
    }
}

fn table_from_snapshot(
    table_id: TableId,
    capacity: u32,
    num_reserved: u32,
    num_occupied: u32,
    guests: &[GuestRecord],
) -> TableState {
    let mut ts = TableState::new(table_id, capacity);
    ts.num_reserved = num_reserved;
    ts.num_occupied = num_occupied;
    ts.guests = guests.iter().map(|g| (g.name.clone(), g.clone())).collect();
    ts
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: VenueStore::new(),
            wal_tx,
            provision_lock: Mutex::new(()),
        };

        // Replay: we are the sole owner of these Arcs, so try_write always
        // succeeds. Never block here; this may run inside an async context.
        for event in &events {
            match event {
                Event::TableProvisioned { table_id, capacity } => {
                    let ts = TableState::new(*table_id, *capacity);
                    engine.store.insert_table(*table_id, Arc::new(RwLock::new(ts)));
                }
                Event::TableSnapshot {
                    table_id,
                    capacity,
                    num_reserved,
                    num_occupied,
                    guests,
                } => {
                    let ts =
                        table_from_snapshot(*table_id, *capacity, *num_reserved, *num_occupied, guests);
                    for name in ts.guests.keys() {
                        engine.store.index_guest(name.clone(), *table_id);
                    }
                    engine.store.insert_table(*table_id, Arc::new(RwLock::new(ts)));
                }
                other => {
                    let table_id = other.table_id();
                    let Some(table) = engine.store.get_table(&table_id) else {
                        warn!("replay: event for unknown table {table_id} skipped");
                        continue;
                    };
                    let Ok(mut guard) = table.try_write() else {
                        warn!("replay: table {table_id} unexpectedly locked");
                        continue;
                    };
                    if let Event::GuestReserved { name, .. } = other {
                        engine.store.index_guest(name.clone(), table_id);
                    }
                    apply_to_table(&mut guard, other);
                }
            }
        }

        tracing::info!(
            "replayed {} WAL events: {} tables, {} guests",
            events.len(),
            engine.store.table_count(),
            engine.store.guest_count()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub fn get_table(&self, id: &TableId) -> Option<SharedTableState> {
        self.store.get_table(id)
    }

    pub fn has_table(&self, id: &TableId) -> bool {
        self.store.contains_table(id)
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TableState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_table(ts, event);
        Ok(())
    }

    /// Lookup guest name → table, acquire that table's write lock.
    pub(super) async fn resolve_guest_write(
        &self,
        name: &str,
    ) -> Result<OwnedRwLockWriteGuard<TableState>, EngineError> {
        let table_id = self
            .store
            .table_for_guest(name)
            .ok_or_else(|| EngineError::NoReservation(name.to_string()))?;
        let table = self
            .store
            .get_table(&table_id)
            .ok_or(EngineError::UnknownTable(table_id))?;
        Ok(table.write_owned().await)
    }
}
