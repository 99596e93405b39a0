//! Downstream services the reservation saga drives, with in-memory
//! simulations.

pub mod billing;
pub mod booking;
pub mod inventory;
pub mod simulation;

pub use billing::{BillingService, InMemoryBillingService};
pub use booking::{BookingService, InMemoryBookingService};
pub use inventory::{InMemoryInventoryService, InventoryService};
pub use simulation::{Behavior, Simulation};
