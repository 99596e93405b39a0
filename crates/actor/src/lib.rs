//! One entity per reservation.
//!
//! Every reservation id is owned by a single [`ReservationEntity`] task. All
//! operations for that id go through its mailbox and are handled in receipt
//! order, so two sagas never touch the same reservation at once. Callers
//! address entities through [`ReservationRegistry::proxy`], which returns an
//! [`EntityHandle`].

pub mod entity;
pub mod error;
pub mod handle;
pub mod registry;

pub use entity::{EntityStatus, ReservationEntity};
pub use error::{EntityError, Result};
pub use handle::EntityHandle;
pub use registry::ReservationRegistry;
