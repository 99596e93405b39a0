//! Reserve-then-cancel walk through the whole stack.

use std::sync::Arc;

use actor::ReservationRegistry;
use common::ReservationInfo;
use saga::{
    InMemoryBillingService, InMemoryBookingService, InMemoryInventoryService, InMemoryNotifier,
    Notification, ReservationSaga, SagaResult, Simulation,
};
use state_store::{InMemoryStateStore, StateStore};

use crate::config::Config;
use crate::error::Result;

/// What the demo produced.
#[derive(Debug)]
pub struct DemoReport {
    pub reservation: SagaResult,
    pub cancellation: SagaResult,
    /// The audit trail of the reservation after both sagas.
    pub trail: Option<SagaResult>,
    pub notifications: Vec<(String, Notification)>,
}

/// Reserves a car for the configured customer and cancels it again, both
/// through the reservation's entity.
#[tracing::instrument(skip_all, fields(customer = %config.customer_name))]
pub async fn run(config: &Config) -> Result<DemoReport> {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let notifier = InMemoryNotifier::new();
    let simulation = |service| Simulation::new(service).with_ack_delay(config.ack_delay);

    let saga = ReservationSaga::new(
        InMemoryBookingService::with_simulation(simulation("booking")),
        InMemoryInventoryService::with_simulation(simulation("inventory")),
        InMemoryBillingService::with_simulation(simulation("billing")),
        store.clone(),
        config.saga_config(),
    )?;
    let registry = ReservationRegistry::new(saga, store, Arc::new(notifier.clone()));

    let info = ReservationInfo::generate(config.customer_name.as_str(), config.car_class.as_str())?;
    let id = info.reservation_id;
    tracing::info!(reservation_id = %id, car_class = %info.car_class, "demo reservation");

    let reservation = registry.proxy(id).reserve_car(info.clone()).await?;
    tracing::info!(outcome = %reservation.outcome, "reservation saga done");

    let cancellation = registry.proxy(id).cancel_car_reservation(info).await?;
    tracing::info!(outcome = %cancellation.outcome, "cancellation saga done");

    let trail = match registry.saga().log().read(id).await {
        Ok(trail) => trail,
        Err(e) => {
            tracing::warn!(error = %e, "audit trail unreadable");
            None
        }
    };
    registry.shutdown().await;

    Ok(DemoReport {
        reservation,
        cancellation,
        trail,
        notifications: notifier.published(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use saga::SagaOutcome;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_demo_reserves_then_cancels() {
        let config = Config {
            ack_delay: Duration::from_millis(50),
            ..Config::default()
        };

        let report = run(&config).await.unwrap();

        assert_eq!(report.reservation.outcome, SagaOutcome::Reserved);
        assert_eq!(report.cancellation.outcome, SagaOutcome::Cancelled);
        assert_eq!(report.trail.unwrap().outcome, SagaOutcome::Cancelled);

        let finished = report
            .notifications
            .iter()
            .filter(|(recipient, n)| {
                recipient == "Alice" && matches!(n, Notification::SagaFinished(_))
            })
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_demo_rejects_invalid_options() {
        let config = Config {
            backoff_coefficient: 0.1,
            ..Config::default()
        };
        assert!(run(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_demo_rejects_empty_customer() {
        let config = Config {
            customer_name: String::new(),
            ..Config::default()
        };
        assert!(run(&config).await.is_err());
    }
}
