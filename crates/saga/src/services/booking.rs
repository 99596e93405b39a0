//! Booking service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{ReservationId, ReservationInfo, ReservationState};

use crate::error::Result;
use crate::step::Invocation;

use super::simulation::Simulation;

/// Trait for the booking service.
///
/// Actions return once the request is accepted. The outcome arrives later
/// as a completion event sent to `invocation.reply_to`.
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Books a car for the reservation.
    async fn reserve(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Cancels the booking. Cancelling an unknown booking succeeds.
    async fn cancel(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Reads the booking directly.
    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<ReservationState>;
}

/// In-memory booking service for tests and the demo.
#[derive(Debug, Clone)]
pub struct InMemoryBookingService {
    bookings: Arc<RwLock<HashMap<ReservationId, ReservationState>>>,
    simulation: Simulation,
}

impl Default for InMemoryBookingService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBookingService {
    pub const RESERVE: &'static str = "reserve";
    pub const CANCEL: &'static str = "cancel";

    pub fn new() -> Self {
        Self::with_simulation(Simulation::new("booking"))
    }

    pub fn with_simulation(simulation: Simulation) -> Self {
        Self {
            bookings: Arc::new(RwLock::new(HashMap::new())),
            simulation,
        }
    }

    /// The script driving this service.
    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Whether a car is currently booked for `reservation_id`.
    pub fn is_booked(&self, reservation_id: ReservationId) -> bool {
        self.bookings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reservation_id)
            .is_some_and(|b| b.is_reserved)
    }
}

#[async_trait]
impl BookingService for InMemoryBookingService {
    async fn reserve(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::RESERVE, &invocation, || {
                let state = ReservationState {
                    reservation_id: info.reservation_id,
                    is_reserved: true,
                    customer_name: Some(info.customer_name.clone()),
                    car_class: Some(info.car_class.clone()),
                };
                self.bookings
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(info.reservation_id, state);
            })
            .await
    }

    async fn cancel(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::CANCEL, &invocation, || {
                if let Some(booking) = self
                    .bookings
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_mut(&info.reservation_id)
                {
                    booking.is_reserved = false;
                }
            })
            .await
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<ReservationState> {
        self.simulation.query()?;
        Ok(self
            .bookings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reservation_id)
            .cloned()
            .unwrap_or_else(|| ReservationState::absent(reservation_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationRegistry;
    use crate::services::Behavior;
    use common::AttemptToken;

    fn invocation(registry: &Arc<CorrelationRegistry>, event_name: &str) -> Invocation {
        Invocation {
            reservation_id: registry.reservation_id(),
            step: "book_car".to_string(),
            event_name: event_name.to_string(),
            attempt: 1,
            token: AttemptToken::new(1),
            reply_to: registry.clone(),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_cancel() {
        let service = InMemoryBookingService::new();
        let info = ReservationInfo::generate("Alice", "SUV").unwrap();
        let registry = Arc::new(CorrelationRegistry::new(info.reservation_id));

        service
            .reserve(&info, invocation(&registry, "BookingCompleted"))
            .await
            .unwrap();
        let state = service.get_reservation(info.reservation_id).await.unwrap();
        assert!(state.is_reserved);
        assert_eq!(state.customer_name.as_deref(), Some("Alice"));

        service
            .cancel(&info, invocation(&registry, "BookingCancelled"))
            .await
            .unwrap();
        assert!(!service.is_booked(info.reservation_id));
        assert_eq!(service.simulation().calls(InMemoryBookingService::CANCEL), 1);
    }

    #[tokio::test]
    async fn test_scripted_behaviors() {
        let service = InMemoryBookingService::new();
        service.simulation().script(
            InMemoryBookingService::RESERVE,
            [Behavior::Fail, Behavior::ApplySilently],
        );
        let info = ReservationInfo::generate("Bob", "Compact").unwrap();
        let registry = Arc::new(CorrelationRegistry::new(info.reservation_id));

        let first = service
            .reserve(&info, invocation(&registry, "BookingCompleted"))
            .await;
        assert!(first.is_err());
        assert!(!service.is_booked(info.reservation_id));

        service
            .reserve(&info, invocation(&registry, "BookingCompleted"))
            .await
            .unwrap();
        assert!(service.is_booked(info.reservation_id));
    }

    #[tokio::test]
    async fn test_unknown_reservation_is_absent() {
        let service = InMemoryBookingService::new();
        let id = ReservationId::new();
        assert_eq!(
            service.get_reservation(id).await.unwrap(),
            ReservationState::absent(id)
        );

        service.simulation().set_query_failure(true);
        assert!(service.get_reservation(id).await.is_err());
        assert_eq!(service.simulation().queries(), 2);
    }
}
