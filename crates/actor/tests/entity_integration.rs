//! Integration tests for reservation entities and the registry.

use std::sync::Arc;
use std::time::Duration;

use actor::{EntityError, EntityHandle, EntityStatus, ReservationRegistry};
use common::{ReservationId, ReservationInfo};
use saga::{
    Behavior, CheckpointLedger, CompletionEvent, InFlightSaga, InMemoryBillingService,
    InMemoryBookingService, InMemoryInventoryService, InMemoryNotifier, Phase, ReservationSaga,
    SagaConfig, SagaKind, SagaOutcome, SagaState, Simulation,
};
use state_store::{InMemoryStateStore, StateStore};
use tokio::time::Instant;

type TestRegistry =
    ReservationRegistry<InMemoryBookingService, InMemoryInventoryService, InMemoryBillingService>;

struct TestHarness {
    registry: TestRegistry,
    store: Arc<dyn StateStore>,
    booking: InMemoryBookingService,
    inventory: InMemoryInventoryService,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_ack_delay(Duration::ZERO)
    }

    fn with_ack_delay(delay: Duration) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let booking =
            InMemoryBookingService::with_simulation(Simulation::new("booking").with_ack_delay(delay));
        let inventory = InMemoryInventoryService::with_simulation(
            Simulation::new("inventory").with_ack_delay(delay),
        );
        let billing =
            InMemoryBillingService::with_simulation(Simulation::new("billing").with_ack_delay(delay));

        let saga = ReservationSaga::new(
            booking.clone(),
            inventory.clone(),
            billing,
            store.clone(),
            SagaConfig::default(),
        )
        .unwrap();
        let registry =
            ReservationRegistry::new(saga, store.clone(), Arc::new(InMemoryNotifier::new()));

        Self {
            registry,
            store,
            booking,
            inventory,
        }
    }
}

fn reservation(customer: &str) -> ReservationInfo {
    ReservationInfo::generate(customer, "Compact").unwrap()
}

/// Polls until the entity has finished a saga.
async fn settled(handle: &EntityHandle) -> EntityStatus {
    for _ in 0..600 {
        let status = handle.status().await.unwrap();
        if status.running.is_none() && status.last_outcome.is_some() {
            return status;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("saga did not finish");
}

#[tokio::test(start_paused = true)]
async fn test_reserve_through_proxy() {
    let h = TestHarness::new();
    let info = reservation("Alice");

    let result = h
        .registry
        .proxy(info.reservation_id)
        .reserve_car(info.clone())
        .await
        .unwrap();

    assert_eq!(result.outcome, SagaOutcome::Reserved);
    assert!(h.booking.is_booked(info.reservation_id));
    assert_eq!(h.registry.active_count(), 1);

    let status = h.registry.proxy(info.reservation_id).status().await.unwrap();
    assert_eq!(status.running, None);
    assert_eq!(status.state, SagaState::Succeeded);
    assert_eq!(status.last_outcome, Some(SagaOutcome::Reserved));
}

#[tokio::test(start_paused = true)]
async fn test_operations_on_one_reservation_are_serialized() {
    let h = TestHarness::with_ack_delay(Duration::from_secs(1));
    let info = reservation("Bob");
    let handle = h.registry.proxy(info.reservation_id);

    let (reserved, cancelled) = tokio::join!(
        handle.reserve_car(info.clone()),
        handle.cancel_car_reservation(info.clone()),
    );

    assert_eq!(reserved.unwrap().outcome, SagaOutcome::Reserved);
    assert_eq!(cancelled.unwrap().outcome, SagaOutcome::Cancelled);

    let trail = h
        .registry
        .saga()
        .log()
        .read(info.reservation_id)
        .await
        .unwrap()
        .unwrap();
    let reserve = trail.log.find("reserve saga finished").unwrap();
    let cancel = trail.log.find("cancel saga finished").unwrap();
    assert!(reserve < cancel);
    assert!(!h.booking.is_booked(info.reservation_id));
    assert!(!h.inventory.is_held(info.reservation_id));
}

#[tokio::test(start_paused = true)]
async fn test_status_and_abort_while_running() {
    let h = TestHarness::new();
    h.booking
        .simulation()
        .set_default(InMemoryBookingService::RESERVE, Behavior::Drop);
    let info = reservation("Carol");
    let handle = h.registry.proxy(info.reservation_id);

    let running = {
        let handle = handle.clone();
        let info = info.clone();
        tokio::spawn(async move { handle.reserve_car(info).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.running, Some(SagaKind::Reserve));
    assert_eq!(status.state, SagaState::Executing(Phase::Booking));

    assert!(handle.abort().await.unwrap());
    let result = running.await.unwrap().unwrap();
    assert_eq!(result.outcome, SagaOutcome::Aborted);
    assert!(!handle.abort().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_evicted_saga_resumes_where_it_stopped() {
    let h = TestHarness::new();
    h.booking
        .simulation()
        .script(InMemoryBookingService::RESERVE, [Behavior::Drop]);
    let info = reservation("Dave");
    let id = info.reservation_id;

    let abandoned = {
        let handle = h.registry.proxy(id);
        let info = info.clone();
        tokio::spawn(async move { handle.reserve_car(info).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.registry.evict(id).await);
    assert!(matches!(
        abandoned.await.unwrap(),
        Err(EntityError::NoReply(_))
    ));
    assert_eq!(h.registry.active_count(), 0);

    assert_eq!(h.registry.resume(id).await.unwrap(), Some(SagaKind::Reserve));
    let status = settled(&h.registry.proxy(id)).await;

    assert_eq!(status.last_outcome, Some(SagaOutcome::Reserved));
    assert_eq!(h.booking.simulation().calls(InMemoryBookingService::RESERVE), 2);
    assert_eq!(h.registry.resume(id).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_new_saga_after_eviction_starts_with_fresh_retries() {
    let h = TestHarness::new();
    h.booking.simulation().script(
        InMemoryBookingService::RESERVE,
        [Behavior::Drop, Behavior::Drop, Behavior::Drop],
    );
    let info = reservation("Ivan");
    let id = info.reservation_id;

    let abandoned = {
        let handle = h.registry.proxy(id);
        let info = info.clone();
        tokio::spawn(async move { handle.reserve_car(info).await })
    };
    // Attempt 3 of book_car is waiting.
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(h.registry.evict(id).await);
    assert!(abandoned.await.unwrap().is_err());

    let cancelled = h
        .registry
        .proxy(id)
        .cancel_car_reservation(info.clone())
        .await
        .unwrap();
    assert_eq!(cancelled.outcome, SagaOutcome::Cancelled);

    h.booking
        .simulation()
        .script(InMemoryBookingService::RESERVE, [Behavior::Reject]);
    let result = h.registry.proxy(id).reserve_car(info).await.unwrap();

    assert_eq!(result.outcome, SagaOutcome::Reserved);
    assert_eq!(h.booking.simulation().calls(InMemoryBookingService::RESERVE), 5);
    assert!(!result.log.contains("resumed"));
    assert!(result.log.contains("book_car attempt 2: completed successfully"));
}

#[tokio::test(start_paused = true)]
async fn test_eviction_during_last_attempt_reconciles_on_resume() {
    let h = TestHarness::new();
    let info = reservation("Judy");
    let id = info.reservation_id;
    let reserved = h.registry.proxy(id).reserve_car(info.clone()).await.unwrap();
    assert_eq!(reserved.outcome, SagaOutcome::Reserved);

    h.booking.simulation().script(
        InMemoryBookingService::CANCEL,
        [
            Behavior::Drop,
            Behavior::Drop,
            Behavior::Drop,
            Behavior::ApplySilently,
        ],
    );
    let abandoned = {
        let handle = h.registry.proxy(id);
        let info = info.clone();
        tokio::spawn(async move { handle.cancel_car_reservation(info).await })
    };
    // Attempts start at 0s, 35s, 75s and 125s; the fourth waits until 155s.
    tokio::time::sleep(Duration::from_secs(130)).await;
    assert!(h.registry.evict(id).await);
    assert!(abandoned.await.unwrap().is_err());
    assert!(!h.booking.is_booked(id));
    assert_eq!(h.booking.simulation().queries(), 3);

    assert_eq!(h.registry.resume(id).await.unwrap(), Some(SagaKind::Cancel));
    let status = settled(&h.registry.proxy(id)).await;

    assert_eq!(status.last_outcome, Some(SagaOutcome::Cancelled));
    assert_eq!(status.state, SagaState::Succeeded);
    assert_eq!(h.booking.simulation().calls(InMemoryBookingService::CANCEL), 4);
    assert_eq!(h.booking.simulation().queries(), 4);
    assert!(!h.inventory.is_held(id));
}

#[tokio::test(start_paused = true)]
async fn test_resume_with_every_step_done_ends_succeeded() {
    let h = TestHarness::new();
    let info = reservation("Ken");
    let id = info.reservation_id;
    let mut record = InFlightSaga::new(SagaKind::Cancel, info, chrono::Utc::now());
    record.completed_steps = vec!["cancel_booking".to_string(), "release_inventory".to_string()];
    CheckpointLedger::new(h.store.clone(), id)
        .record_in_flight(&record)
        .await
        .unwrap();

    assert_eq!(h.registry.resume(id).await.unwrap(), Some(SagaKind::Cancel));
    let status = settled(&h.registry.proxy(id)).await;

    assert_eq!(status.last_outcome, Some(SagaOutcome::Cancelled));
    assert_eq!(status.state, SagaState::Succeeded);
    assert_eq!(h.booking.simulation().calls(InMemoryBookingService::CANCEL), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entity_stays_registered_until_evicted() {
    let h = TestHarness::new();
    let info = reservation("Liam");
    let id = info.reservation_id;
    let result = h.registry.proxy(id).reserve_car(info).await.unwrap();
    assert_eq!(result.outcome, SagaOutcome::Reserved);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.registry.active_count(), 1);
    let status = h.registry.proxy(id).status().await.unwrap();
    assert_eq!(status.last_outcome, Some(SagaOutcome::Reserved));

    assert!(h.registry.evict(id).await);
    assert_eq!(h.registry.active_count(), 0);
    assert!(!h.registry.evict(id).await);

    let status = h.registry.proxy(id).status().await.unwrap();
    assert_eq!(status.last_outcome, None);
    assert_eq!(h.registry.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_for_another_reservation_is_rejected() {
    let h = TestHarness::new();
    let info = reservation("Erin");

    let err = h
        .registry
        .proxy(ReservationId::new())
        .reserve_car(info)
        .await
        .unwrap_err();

    assert!(matches!(err, EntityError::WrongReservation { .. }));
    assert_eq!(h.booking.simulation().calls(InMemoryBookingService::RESERVE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_completion_event_is_ignored() {
    let h = TestHarness::new();
    let info = reservation("Frank");
    let handle = h.registry.proxy(info.reservation_id);

    let event = CompletionEvent {
        reservation_id: info.reservation_id,
        event_name: "BookingCompleted".to_string(),
        token: None,
        payload: serde_json::Value::Null,
    };
    handle.handle_reservation_action_result(event).await.unwrap();

    let result = handle.reserve_car(info).await.unwrap();
    assert_eq!(result.outcome, SagaOutcome::Reserved);
}

#[tokio::test(start_paused = true)]
async fn test_different_reservations_run_concurrently() {
    let h = TestHarness::with_ack_delay(Duration::from_secs(2));
    let first = reservation("Grace");
    let second = reservation("Heidi");
    let started = Instant::now();

    let first_proxy = h.registry.proxy(first.reservation_id);
    let second_proxy = h.registry.proxy(second.reservation_id);
    let (a, b) = tokio::join!(
        first_proxy.reserve_car(first.clone()),
        second_proxy.reserve_car(second.clone()),
    );

    assert_eq!(a.unwrap().outcome, SagaOutcome::Reserved);
    assert_eq!(b.unwrap().outcome, SagaOutcome::Reserved);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.registry.active_count(), 2);

    h.registry.shutdown().await;
    assert_eq!(h.registry.active_count(), 0);
}
