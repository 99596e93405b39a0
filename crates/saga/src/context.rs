//! Execution context of one saga run.
//!
//! Bundles what a step needs from its surroundings: a logical clock and
//! timers, correlated event waits, the reply address handed to downstream
//! services, checkpoint storage, the notification channel and cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ReservationId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use state_store::StateStore;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointLedger;
use crate::correlation::{CorrelationRegistry, PendingEvent, WaitError};
use crate::error::{Result, SagaError};
use crate::events::CompletionSink;
use crate::notify::{Notification, Notifier};
use crate::state::SagaState;

/// Wall-clock time that advances with the tokio clock.
///
/// Pausing tokio time in tests freezes it too, so wake-up times stay
/// deterministic.
#[derive(Debug, Clone, Copy)]
pub struct LogicalClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl LogicalClock {
    pub fn start() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

/// Everything a saga run needs from the outside world.
pub struct SagaContext {
    reservation_id: ReservationId,
    correlation: Arc<CorrelationRegistry>,
    reply_to: Arc<dyn CompletionSink>,
    checkpoints: CheckpointLedger,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    clock: LogicalClock,
    state: watch::Sender<SagaState>,
}

impl SagaContext {
    /// Creates a context whose completion events are routed straight into
    /// `correlation`.
    pub fn new(
        correlation: Arc<CorrelationRegistry>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let reply_to: Arc<dyn CompletionSink> = correlation.clone();
        Self::with_reply_to(correlation, reply_to, store, notifier)
    }

    /// Creates a context whose completion events travel through `reply_to`
    /// (typically the owning entity's mailbox) before reaching
    /// `correlation`.
    pub fn with_reply_to(
        correlation: Arc<CorrelationRegistry>,
        reply_to: Arc<dyn CompletionSink>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let reservation_id = correlation.reservation_id();
        let (state, _) = watch::channel(SagaState::Start);
        Self {
            reservation_id,
            correlation,
            reply_to,
            checkpoints: CheckpointLedger::new(store, reservation_id),
            notifier,
            cancel: CancellationToken::new(),
            clock: LogicalClock::start(),
            state,
        }
    }

    /// Ties this run to an outside cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    pub fn correlation(&self) -> &Arc<CorrelationRegistry> {
        &self.correlation
    }

    pub fn reply_to(&self) -> Arc<dyn CompletionSink> {
        Arc::clone(&self.reply_to)
    }

    pub fn checkpoints(&self) -> &CheckpointLedger {
        &self.checkpoints
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Logical time of this run.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Suspends until `wake_at`, or until the run is cancelled.
    pub async fn create_timer(&self, wake_at: DateTime<Utc>) -> std::result::Result<(), WaitError> {
        let delay = (wake_at - self.current_time())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(WaitError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Registers interest in the next `event_name` event.
    ///
    /// Must happen before the action that produces the event is invoked.
    pub fn expect_event(&self, event_name: &str) -> PendingEvent {
        self.correlation.register(event_name)
    }

    /// Waits for a registered event and decodes its payload.
    pub async fn wait_for_external_event<T: DeserializeOwned>(
        &self,
        pending: PendingEvent,
        timeout: Duration,
    ) -> std::result::Result<T, WaitError> {
        let event = pending.wait(timeout, &self.cancel).await?;
        Ok(serde_json::from_value(event.payload)?)
    }

    /// Current state of the run.
    pub fn state(&self) -> SagaState {
        *self.state.borrow()
    }

    /// Watches state changes of this run.
    pub fn subscribe_state(&self) -> watch::Receiver<SagaState> {
        self.state.subscribe()
    }

    /// Moves the run to `next`, refusing transitions the state machine
    /// does not allow.
    pub fn transition(&self, next: SagaState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        tracing::debug!(reservation_id = %self.reservation_id, from = %current, to = %next, "saga transition");
        self.state.send_replace(next);
        Ok(())
    }

    /// Tells the parent of this run that `step` finished with `result`.
    pub async fn notify_step_completed<R: Serialize + Sync>(&self, step: &str, result: &R) {
        let result = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(step, error = %e, "step result not serializable, parent not notified");
                return;
            }
        };
        self.publish(
            &self.reservation_id.to_string(),
            Notification::StepCompleted {
                step: step.to_string(),
                result,
            },
        )
        .await;
    }

    /// Publishes to observers. Failures are logged, never returned.
    pub async fn publish(&self, recipient: &str, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.notifier.publish(recipient, notification).await {
            tracing::warn!(recipient, kind, error = %e, "notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::InMemoryNotifier;
    use crate::state::Phase;
    use state_store::InMemoryStateStore;

    fn context() -> SagaContext {
        let correlation = Arc::new(CorrelationRegistry::new(ReservationId::new()));
        SagaContext::new(
            correlation,
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryNotifier::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_advances_logical_time() {
        let ctx = context();
        let start = ctx.current_time();
        ctx.create_timer(start + chrono::Duration::seconds(20))
            .await
            .unwrap();
        let elapsed = ctx.current_time() - start;
        assert!(elapsed >= chrono::Duration::seconds(20));
        assert!(elapsed < chrono::Duration::seconds(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_in_the_past_fires_immediately() {
        let ctx = context();
        let start = ctx.current_time();
        ctx.create_timer(start - chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(ctx.current_time() - start < chrono::Duration::seconds(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_returns_early() {
        let cancel = CancellationToken::new();
        let ctx = context().with_cancellation(cancel.clone());
        cancel.cancel();
        let result = ctx
            .create_timer(ctx.current_time() + chrono::Duration::hours(1))
            .await;
        assert!(matches!(result, Err(WaitError::Cancelled)));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported() {
        let ctx = context();
        let pending = ctx.expect_event("BookingCompleted");
        let token = pending.token();
        ctx.correlation().route(crate::events::CompletionEvent {
            reservation_id: ctx.reservation_id(),
            event_name: "BookingCompleted".into(),
            token: Some(token),
            payload: serde_json::Value::Null,
        });

        let result: std::result::Result<common::ReservationOperationResult, _> = ctx
            .wait_for_external_event(pending, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(WaitError::Malformed(_))));
    }

    #[test]
    fn test_transitions_are_validated() {
        let ctx = context();
        let mut watcher = ctx.subscribe_state();
        ctx.transition(SagaState::Compensating(Phase::Booking))
            .unwrap();
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), SagaState::Compensating(Phase::Booking));

        ctx.transition(SagaState::Failed).unwrap();
        let err = ctx.transition(SagaState::Succeeded).unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition { .. }));
        assert_eq!(ctx.state(), SagaState::Failed);
    }
}
