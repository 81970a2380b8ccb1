//! Unified error types for the bus core using thiserror

use thiserror::Error;

use crate::bus::state::{BusState, PnpEvent};

/// Result alias used throughout the bus core
pub type BusResult<T> = Result<T, BusError>;

/// Errors reported by bus operations
#[derive(Error, Debug)]
pub enum BusError {
    #[error("insufficient resources")]
    InsufficientResources,

    #[error("invalid transition: {event:?} while {state:?}")]
    InvalidTransition { state: BusState, event: PnpEvent },

    #[error("bus is not accepting children while {0:?}")]
    NotAcceptingChildren(BusState),

    #[error("node is not a member of any bus")]
    NodeNotFound,

    #[error("node is already linked into a bus")]
    NodeAlreadyLinked,

    #[error("bus is shutting down")]
    ShuttingDown,

    #[error("bus worker thread already started")]
    ThreadAlreadyStarted,

    #[error("could not spawn bus worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("unit numbers exhausted")]
    UnitNumbersExhausted,
}

impl BusError {
    /// Is this a not-found report that cleanup paths may safely ignore?
    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::NodeNotFound)
    }
}
