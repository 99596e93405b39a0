//! Billing service trait and in-memory implementation.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{BillingState, ReservationId, ReservationInfo};

use crate::error::Result;
use crate::step::Invocation;

use super::simulation::Simulation;

/// Trait for billing operations.
#[async_trait]
pub trait BillingService: Send + Sync {
    /// Charges the customer for the reservation.
    async fn charge(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Refunds a charge. Refunding nothing succeeds.
    async fn refund(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Reads the charge directly.
    async fn get_state(&self, reservation_id: ReservationId) -> Result<BillingState>;
}

/// In-memory billing service for tests and the demo.
#[derive(Debug, Clone)]
pub struct InMemoryBillingService {
    charged: Arc<RwLock<HashSet<ReservationId>>>,
    simulation: Simulation,
}

impl Default for InMemoryBillingService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBillingService {
    pub const CHARGE: &'static str = "charge";
    pub const REFUND: &'static str = "refund";

    pub fn new() -> Self {
        Self::with_simulation(Simulation::new("billing"))
    }

    pub fn with_simulation(simulation: Simulation) -> Self {
        Self {
            charged: Arc::new(RwLock::new(HashSet::new())),
            simulation,
        }
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Returns true if the customer is currently charged for `reservation_id`.
    pub fn is_charged(&self, reservation_id: ReservationId) -> bool {
        self.charged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&reservation_id)
    }
}

#[async_trait]
impl BillingService for InMemoryBillingService {
    async fn charge(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::CHARGE, &invocation, || {
                self.charged
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(info.reservation_id);
            })
            .await
    }

    async fn refund(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::REFUND, &invocation, || {
                self.charged
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&info.reservation_id);
            })
            .await
    }

    async fn get_state(&self, reservation_id: ReservationId) -> Result<BillingState> {
        self.simulation.query()?;
        Ok(BillingState {
            reservation_id,
            is_charged: self.is_charged(reservation_id),
        })
    }
}
