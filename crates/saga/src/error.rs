//! Saga error types.

use common::{ReservationId, ValidationError};
use state_store::StateStoreError;
use thiserror::Error;

use crate::state::SagaState;

/// Errors that can occur during saga operations.
///
/// Step-level failures (timeouts, negative acknowledgements, exhausted
/// retries) are not errors: they are reported through step outcomes and
/// saga results. These variants cover configuration problems and failing
/// collaborators.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Retry or timeout options are unusable.
    #[error("Invalid saga options: {0}")]
    InvalidOptions(String),

    /// The reservation request is malformed.
    #[error("Invalid reservation: {0}")]
    InvalidReservation(#[from] ValidationError),

    /// A state transition the saga state machine does not allow.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    /// A downstream service call failed.
    #[error("{service} service error: {reason}")]
    Service {
        service: &'static str,
        reason: String,
    },

    /// The reply channel of a reservation is gone.
    #[error("Reply channel for reservation {0} is closed")]
    ReplyChannelClosed(ReservationId),

    /// Notification could not be published.
    #[error("Notification error: {0}")]
    Notification(String),

    /// State store error.
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn service(service: &'static str, reason: impl Into<String>) -> Self {
        SagaError::Service {
            service,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
