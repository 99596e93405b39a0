//! Point-in-time views of downstream services.
//!
//! These are fetched on demand to reconcile a step whose acknowledgement
//! never arrived. The saga never persists them.

use serde::{Deserialize, Serialize};

use crate::types::ReservationId;

/// Booking service view of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationState {
    pub reservation_id: ReservationId,
    pub is_reserved: bool,
    pub customer_name: Option<String>,
    pub car_class: Option<String>,
}

impl ReservationState {
    /// A reservation the booking service has no record of.
    pub fn absent(reservation_id: ReservationId) -> Self {
        Self {
            reservation_id,
            is_reserved: false,
            customer_name: None,
            car_class: None,
        }
    }
}

/// Inventory service view of the car held for a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryState {
    pub reservation_id: ReservationId,
    pub car_class: Option<String>,
    pub is_reserved: bool,
}

/// Billing service view of the charge for a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingState {
    pub reservation_id: ReservationId,
    pub is_charged: bool,
}
