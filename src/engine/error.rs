use thiserror::Error;

use crate::model::TableId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("guest already has a reservation: {0}")]
    AlreadyReserved(String),
    #[error("table {table_id} has capacity {capacity}: {requested} seats would be reserved")]
    CapacityExceeded {
        table_id: TableId,
        capacity: u32,
        requested: u64,
    },
    #[error("no such table: {0}")]
    UnknownTable(TableId),
    #[error("no reservation under the name: {0}")]
    NoReservation(String),
    #[error("guest has already arrived: {0}")]
    AlreadyArrived(String),
    #[error("guest has not arrived: {0}")]
    NotArrived(String),
    #[error("table already provisioned: {0}")]
    TableExists(TableId),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl EngineError {
    /// Stable machine-readable label for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AlreadyReserved(_) => "already_reserved",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::UnknownTable(_) => "unknown_table",
            EngineError::NoReservation(_) => "no_reservation",
            EngineError::AlreadyArrived(_) => "already_arrived",
            EngineError::NotArrived(_) => "not_arrived",
            EngineError::TableExists(_) => "table_exists",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}
