//! Completion events reported back by downstream services.

use async_trait::async_trait;
use common::{AttemptToken, ReservationId, ReservationOperationResult};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Event raised once the booking service has booked the car.
pub const BOOKING_COMPLETED: &str = "BookingCompleted";
/// Event raised once the inventory service holds a car.
pub const INVENTORY_RESERVED: &str = "InventoryReserved";
/// Event raised once the billing service has charged the customer.
pub const BILLING_COMPLETED: &str = "BillingCompleted";
/// Event raised once the booking service has cancelled the booking.
pub const BOOKING_CANCELLED: &str = "BookingCancelled";
/// Event raised once the inventory service has released the car.
pub const INVENTORY_RELEASED: &str = "InventoryReleased";

/// An asynchronous completion signal correlated to one step attempt.
///
/// `token` echoes the attempt that triggered it. Events without a token are
/// correlated on `event_name` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub reservation_id: ReservationId,
    pub event_name: String,
    pub token: Option<AttemptToken>,
    pub payload: serde_json::Value,
}

impl CompletionEvent {
    /// Builds an event carrying a [`ReservationOperationResult`].
    pub fn operation(
        event_name: impl Into<String>,
        token: Option<AttemptToken>,
        result: ReservationOperationResult,
    ) -> Result<Self> {
        Ok(Self {
            reservation_id: result.reservation_id,
            event_name: event_name.into(),
            token,
            payload: serde_json::to_value(result)?,
        })
    }
}

/// Where downstream services send completion events.
///
/// In production this is the message-routing layer that forwards an event to
/// the entity owning the reservation.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn deliver(&self, event: CompletionEvent) -> Result<()>;
}
