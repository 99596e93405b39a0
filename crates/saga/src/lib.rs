//! Saga orchestration for car reservations.
//!
//! The building block is [`Step`]: invoke a downstream action, wait for the
//! completion event correlated to that attempt, judge it, and back off and
//! retry when it is missing or negative. A step can reconcile by querying
//! the downstream service directly, and ends with a degraded result once
//! retries run out.
//!
//! [`ReservationSaga`] composes steps into two sagas:
//! 1. Reserve: book the car, hold it in inventory, charge the customer
//! 2. Cancel: cancel the booking, release the inventory hold
//!
//! If a reservation step fails, it and every earlier step are compensated in
//! reverse order through the [`CompensationCoordinator`].

pub mod audit;
pub mod checkpoint;
pub mod compensation;
pub mod context;
pub mod correlation;
pub mod error;
pub mod events;
pub mod notify;
pub mod reservation;
pub mod retry;
pub mod services;
pub mod state;
pub mod step;

pub use audit::{LOG_SEPARATOR, SagaLog, SagaOutcome, SagaResult};
pub use checkpoint::{CheckpointLedger, InFlightSaga, SagaKind, StepCheckpoint};
pub use compensation::{
    CancelBooking, CompensationCoordinator, CompensationOptions, CompensationPhase,
    CompensationReport, CompensationStatus, RefundBilling, ReleaseInventory,
};
pub use context::{LogicalClock, SagaContext};
pub use correlation::{CorrelationRegistry, Delivery, PendingEvent, WaitError};
pub use error::{Result, SagaError};
pub use events::{CompletionEvent, CompletionSink};
pub use notify::{InMemoryNotifier, Notification, Notifier};
pub use reservation::{ReservationSaga, SagaConfig};
pub use retry::{StepExecutionOptions, next_retry_delay};
pub use services::{
    Behavior, BillingService, BookingService, InMemoryBillingService, InMemoryBookingService,
    InMemoryInventoryService, InventoryService, Simulation,
};
pub use state::{Phase, SagaState};
pub use step::{Invocation, Reconciliation, Step, StepOutcome, StepReport};
