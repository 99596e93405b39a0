//! Runner error types.

use actor::EntityError;
use common::ValidationError;
use saga::SagaError;
use thiserror::Error;

/// Errors that stop the demo flow.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The demo reservation is invalid.
    #[error("Invalid demo reservation: {0}")]
    Reservation(#[from] ValidationError),

    /// The saga could not be built, e.g. from invalid options.
    #[error("Saga setup failed: {0}")]
    Saga(#[from] SagaError),

    /// The entity owning the reservation failed.
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),
}

/// Convenience type alias for runner results.
pub type Result<T> = std::result::Result<T, RunnerError>;
