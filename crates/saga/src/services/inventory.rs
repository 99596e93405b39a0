//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{InventoryState, ReservationId, ReservationInfo};

use crate::error::Result;
use crate::step::Invocation;

use super::simulation::Simulation;

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Holds a car of the reservation's class.
    async fn reserve(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Releases the held car. Releasing nothing succeeds.
    async fn release(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Reads the hold directly.
    async fn get_state(&self, reservation_id: ReservationId) -> Result<InventoryState>;
}

/// In-memory inventory service for tests and the demo.
#[derive(Debug, Clone)]
pub struct InMemoryInventoryService {
    holds: Arc<RwLock<HashMap<ReservationId, String>>>,
    simulation: Simulation,
}

impl Default for InMemoryInventoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInventoryService {
    pub const RESERVE: &'static str = "reserve";
    pub const RELEASE: &'static str = "release";

    pub fn new() -> Self {
        Self::with_simulation(Simulation::new("inventory"))
    }

    pub fn with_simulation(simulation: Simulation) -> Self {
        Self {
            holds: Arc::new(RwLock::new(HashMap::new())),
            simulation,
        }
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Returns the number of cars currently held.
    pub fn hold_count(&self) -> usize {
        self.holds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if a car is held for `reservation_id`.
    pub fn is_held(&self, reservation_id: ReservationId) -> bool {
        self.holds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&reservation_id)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::RESERVE, &invocation, || {
                self.holds
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(info.reservation_id, info.car_class.clone());
            })
            .await
    }

    async fn release(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.simulation
            .perform(Self::RELEASE, &invocation, || {
                self.holds
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&info.reservation_id);
            })
            .await
    }

    async fn get_state(&self, reservation_id: ReservationId) -> Result<InventoryState> {
        self.simulation.query()?;
        let car_class = self
            .holds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reservation_id)
            .cloned();
        Ok(InventoryState {
            reservation_id,
            is_reserved: car_class.is_some(),
            car_class,
        })
    }
}
