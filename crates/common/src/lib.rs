//! Shared types for the car reservation saga.

pub mod snapshot;
pub mod types;

pub use snapshot::{BillingState, InventoryState, ReservationState};
pub use types::{
    AttemptToken, ReservationId, ReservationInfo, ReservationOperationResult, ValidationError,
};
