//! Addressing for reservation entities.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::ReservationId;
use saga::{
    BillingService, BookingService, InventoryService, Notifier, ReservationSaga, SagaKind,
};
use state_store::StateStore;

use crate::entity::ReservationEntity;
use crate::error::Result;
use crate::handle::EntityHandle;

const SHARDS: usize = 16;
const MAILBOX_CAPACITY: usize = 64;

type Shard = Mutex<HashMap<ReservationId, EntityHandle>>;

/// Maps each reservation id to the one entity that owns it.
///
/// Entities are spawned on first use and stay registered while idle: the
/// registry keeps a handle, so an entity only stops through [`evict`] or
/// [`shutdown`]. A handle whose entity has stopped is replaced by a fresh
/// entity the next time the id is addressed.
///
/// [`evict`]: ReservationRegistry::evict
/// [`shutdown`]: ReservationRegistry::shutdown
pub struct ReservationRegistry<B, I, P> {
    saga: Arc<ReservationSaga<B, I, P>>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    shards: Vec<Shard>,
}

impl<B, I, P> ReservationRegistry<B, I, P>
where
    B: BookingService + 'static,
    I: InventoryService + 'static,
    P: BillingService + 'static,
{
    pub fn new(
        saga: ReservationSaga<B, I, P>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            saga: Arc::new(saga),
            store,
            notifier,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn saga(&self) -> &ReservationSaga<B, I, P> {
        &self.saga
    }

    /// Returns the handle for `reservation_id`, spawning its entity if needed.
    pub fn proxy(&self, reservation_id: ReservationId) -> EntityHandle {
        let mut shard = self.shard(reservation_id);
        if let Some(handle) = shard.get(&reservation_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (entity, tx) = ReservationEntity::new(
            reservation_id,
            self.saga.clone(),
            self.store.clone(),
            self.notifier.clone(),
            MAILBOX_CAPACITY,
        );
        tokio::spawn(entity.run());
        tracing::debug!(%reservation_id, "entity spawned");

        let handle = EntityHandle::new(reservation_id, tx);
        shard.insert(reservation_id, handle.clone());
        handle
    }

    /// Stops the entity for `reservation_id`, abandoning its running saga.
    ///
    /// Returns `false` when no live entity was registered.
    pub async fn evict(&self, reservation_id: ReservationId) -> bool {
        let handle = self.shard(reservation_id).remove(&reservation_id);
        match handle {
            Some(handle) => {
                let stopped = handle.evict().await.is_ok();
                if stopped {
                    tracing::info!(%reservation_id, "entity evicted");
                }
                stopped
            }
            None => false,
        }
    }

    /// Restarts the saga left in flight for `reservation_id`, if any.
    pub async fn resume(&self, reservation_id: ReservationId) -> Result<Option<SagaKind>> {
        self.proxy(reservation_id).resume().await
    }

    /// Number of live entities.
    pub fn active_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                lock(shard)
                    .values()
                    .filter(|handle| !handle.is_closed())
                    .count()
            })
            .sum()
    }

    /// Evicts every entity.
    pub async fn shutdown(&self) {
        let handles: Vec<EntityHandle> = self
            .shards
            .iter()
            .flat_map(|shard| lock(shard).drain().map(|(_, handle)| handle).collect::<Vec<_>>())
            .collect();
        let count = handles.len();
        for handle in handles {
            let _ = handle.evict().await;
        }
        tracing::info!(entities = count, "registry shut down");
    }

    fn shard(&self, reservation_id: ReservationId) -> MutexGuard<'_, HashMap<ReservationId, EntityHandle>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        reservation_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        lock(&self.shards[index])
    }
}

// A poisoned shard still holds valid handles.
fn lock(shard: &Shard) -> MutexGuard<'_, HashMap<ReservationId, EntityHandle>> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}
