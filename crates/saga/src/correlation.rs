//! Matching completion events to the step attempt waiting for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{AttemptToken, ReservationId};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{CompletionEvent, CompletionSink};

/// Why waiting for a completion event ended without one.
#[derive(Debug, Error)]
pub enum WaitError {
    /// No event arrived within the bound.
    #[error("no event within {0:?}")]
    Timeout(Duration),

    /// The saga was cancelled while waiting.
    #[error("wait cancelled")]
    Cancelled,

    /// A newer registration for the same event replaced this one.
    #[error("registration superseded")]
    Superseded,

    /// The event arrived but its payload has the wrong shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the attempt waiting for it.
    Delivered,
    /// Echoed a token other than the active attempt's; dropped.
    Stale {
        active: AttemptToken,
        received: AttemptToken,
    },
    /// Nobody is waiting for this event name; dropped.
    Unexpected,
}

struct Waiter {
    token: AttemptToken,
    tx: oneshot::Sender<CompletionEvent>,
}

/// Per-reservation table of attempts waiting for a completion event.
///
/// At most one attempt waits per event name. Registering again for the same
/// name supersedes the older attempt, so a late event can only ever reach
/// the newest one, and only if its token matches.
pub struct CorrelationRegistry {
    reservation_id: ReservationId,
    last_token: AtomicU64,
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl CorrelationRegistry {
    pub fn new(reservation_id: ReservationId) -> Self {
        Self {
            reservation_id,
            last_token: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    /// The most recently issued token.
    pub fn last_token(&self) -> AttemptToken {
        AttemptToken::new(self.last_token.load(Ordering::SeqCst))
    }

    /// Makes sure future tokens are issued after `token`.
    ///
    /// Used when resuming from a checkpoint so that events addressed to
    /// attempts made before a restart are recognised as stale.
    pub fn advance_past(&self, token: AttemptToken) {
        self.last_token.fetch_max(token.as_u64(), Ordering::SeqCst);
    }

    /// Registers a new attempt waiting for `event_name`.
    pub fn register(self: &Arc<Self>, event_name: &str) -> PendingEvent {
        let token = AttemptToken::new(self.last_token.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();

        let previous = self
            .lock()
            .insert(event_name.to_string(), Waiter { token, tx });
        if let Some(previous) = previous {
            tracing::debug!(
                reservation_id = %self.reservation_id,
                event_name,
                superseded = %previous.token,
                %token,
                "registration superseded"
            );
        }

        PendingEvent {
            registry: Arc::clone(self),
            event_name: event_name.to_string(),
            token,
            rx: Some(rx),
        }
    }

    /// Routes an event to the attempt waiting for it.
    pub fn route(&self, event: CompletionEvent) -> Delivery {
        let mut waiters = self.lock();
        let Some(waiter) = waiters.get(&event.event_name) else {
            tracing::debug!(
                reservation_id = %self.reservation_id,
                event_name = %event.event_name,
                "no attempt waiting, event dropped"
            );
            return Delivery::Unexpected;
        };

        if let Some(received) = event.token
            && received != waiter.token
        {
            let active = waiter.token;
            tracing::debug!(
                reservation_id = %self.reservation_id,
                event_name = %event.event_name,
                %active,
                %received,
                "stale event dropped"
            );
            return Delivery::Stale { active, received };
        }

        let Some(waiter) = waiters.remove(&event.event_name) else {
            return Delivery::Unexpected;
        };
        drop(waiters);

        // The receiver may have given up in the meantime.
        match waiter.tx.send(event) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Unexpected,
        }
    }

    /// Number of attempts currently waiting.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn deregister(&self, event_name: &str, token: AttemptToken) {
        let mut waiters = self.lock();
        if waiters.get(event_name).is_some_and(|w| w.token == token) {
            waiters.remove(event_name);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CompletionSink for CorrelationRegistry {
    async fn deliver(&self, event: CompletionEvent) -> Result<()> {
        self.route(event);
        Ok(())
    }
}

/// A registered attempt. Dropping it removes the registration.
pub struct PendingEvent {
    registry: Arc<CorrelationRegistry>,
    event_name: String,
    token: AttemptToken,
    rx: Option<oneshot::Receiver<CompletionEvent>>,
}

impl PendingEvent {
    pub fn token(&self) -> AttemptToken {
        self.token
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Waits for the event, at most `timeout`, unless `cancel` fires first.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<CompletionEvent, WaitError> {
        let Some(rx) = self.rx.take() else {
            return Err(WaitError::Superseded);
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WaitError::Cancelled),
            received = tokio::time::timeout(timeout, rx) => match received {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(WaitError::Superseded),
                Err(_) => Err(WaitError::Timeout(timeout)),
            },
        }
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        self.registry.deregister(&self.event_name, self.token);
    }
}
