//! Entity error types.

use common::ReservationId;
use saga::SagaError;
use thiserror::Error;

/// Errors returned by entity handles.
#[derive(Debug, Error)]
pub enum EntityError {
    /// The entity task is gone, e.g. after eviction.
    #[error("Entity for reservation {0} is not running")]
    Stopped(ReservationId),

    /// The entity stopped before answering.
    #[error("Entity for reservation {0} stopped before replying")]
    NoReply(ReservationId),

    /// A request addressed to another reservation.
    #[error("Reservation {received} sent to the entity of {entity}")]
    WrongReservation {
        entity: ReservationId,
        received: ReservationId,
    },

    /// The saga task panicked.
    #[error("Saga task for reservation {0} panicked")]
    SagaPanicked(ReservationId),

    /// Saga-level error.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}

/// Convenience type alias for entity results.
pub type Result<T> = std::result::Result<T, EntityError>;
