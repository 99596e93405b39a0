//! Key-value state store used by the saga for audit logs and checkpoints.
//!
//! Every entry carries a [`Version`] that increments on each write, so
//! callers can do compare-and-swap updates with [`SaveOptions::expect_version`].
//! Entries may carry a time-to-live after which they read as absent.

pub mod error;
pub mod memory;
pub mod store;
pub mod version;

pub use error::{Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use store::{SaveOptions, StateStore, StateStoreExt, StoredValue};
pub use version::Version;
