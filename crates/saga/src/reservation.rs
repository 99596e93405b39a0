//! The car reservation saga and its cancellation counterpart.

use std::sync::Arc;
use std::time::Duration;

use common::{ReservationInfo, ReservationOperationResult};
use serde::{Deserialize, Serialize};
use state_store::StateStore;
use tokio::time::Instant;

use crate::audit::{DEFAULT_LOG_TTL, SagaLog, SagaOutcome, SagaResult};
use crate::checkpoint::{InFlightSaga, SagaKind};
use crate::compensation::{
    CancelBooking, CompensationCoordinator, CompensationOptions, CompensationPhase,
    CompensationReport, CompensationStatus, RefundBilling, ReleaseInventory, STEP_CANCEL_BOOKING,
    STEP_REFUND_BILLING, STEP_RELEASE_INVENTORY,
};
use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::events::{BILLING_COMPLETED, BOOKING_COMPLETED, INVENTORY_RESERVED};
use crate::notify::Notification;
use crate::retry::StepExecutionOptions;
use crate::services::{BillingService, BookingService, InventoryService};
use crate::state::{Phase, SagaState};
use crate::step::{Reconciliation, Step, StepOutcome, StepReport};

pub const STEP_BOOK_CAR: &str = "book_car";
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";
pub const STEP_CHARGE_BILLING: &str = "charge_billing";

const ALL_STEPS: [&str; 6] = [
    STEP_BOOK_CAR,
    STEP_RESERVE_INVENTORY,
    STEP_CHARGE_BILLING,
    STEP_CANCEL_BOOKING,
    STEP_RELEASE_INVENTORY,
    STEP_REFUND_BILLING,
];

const FORWARD_PHASES: [Phase; 3] = [Phase::Booking, Phase::Inventory, Phase::Billing];

/// Configuration shared by every saga a [`ReservationSaga`] runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Retry options of forward steps.
    pub step: StepExecutionOptions,
    /// Retry options and per-attempt timeout of compensations.
    pub compensation: CompensationOptions,
    /// Retention of the audit trail.
    pub log_ttl: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step: StepExecutionOptions::default(),
            compensation: CompensationOptions::default(),
            log_ttl: DEFAULT_LOG_TTL,
        }
    }
}

impl SagaConfig {
    pub fn validate(&self) -> Result<()> {
        self.step.validate()?;
        self.compensation.validate()?;
        if self.log_ttl.is_zero() {
            return Err(SagaError::InvalidOptions(
                "log_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrates reservations across booking, inventory and billing.
///
/// Reserving books the car, holds it in inventory and charges the
/// customer. When a step exhausts its retries the saga undoes that step and
/// every earlier one, newest first. Cancelling cancels the booking, then
/// releases the inventory hold.
pub struct ReservationSaga<B, I, P> {
    booking: B,
    inventory: I,
    billing: P,
    book_car: Step<ReservationOperationResult>,
    reserve_inventory: Step<ReservationOperationResult>,
    charge_billing: Step<ReservationOperationResult>,
    compensation: CompensationCoordinator,
    log: SagaLog,
}

impl<B, I, P> ReservationSaga<B, I, P>
where
    B: BookingService + 'static,
    I: InventoryService + 'static,
    P: BillingService + 'static,
{
    /// Creates the saga, rejecting an invalid configuration before anything
    /// runs.
    pub fn new(
        booking: B,
        inventory: I,
        billing: P,
        store: Arc<dyn StateStore>,
        config: SagaConfig,
    ) -> Result<Self> {
        config.validate()?;
        let forward = |name: &str, event: &str| {
            Ok::<_, SagaError>(
                Step::new(name, event, config.step.clone())?
                    .with_criteria(|result: &ReservationOperationResult| result.success),
            )
        };

        Ok(Self {
            book_car: forward(STEP_BOOK_CAR, BOOKING_COMPLETED)?,
            reserve_inventory: forward(STEP_RESERVE_INVENTORY, INVENTORY_RESERVED)?,
            charge_billing: forward(STEP_CHARGE_BILLING, BILLING_COMPLETED)?,
            compensation: CompensationCoordinator::new(config.compensation.clone())?,
            log: SagaLog::new(store).with_ttl(config.log_ttl),
            booking,
            inventory,
            billing,
        })
    }

    pub fn booking(&self) -> &B {
        &self.booking
    }

    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    pub fn billing(&self) -> &P {
        &self.billing
    }

    /// The audit trail shared by every saga of a reservation.
    pub fn log(&self) -> &SagaLog {
        &self.log
    }

    /// Books, holds and charges for `info`, compensating on failure.
    ///
    /// Always returns a terminal result. `Reserved` means every step went
    /// through; anything else means the reservation does not stand.
    #[tracing::instrument(skip_all, fields(reservation_id = %info.reservation_id, saga = "reserve"))]
    pub async fn reserve(&self, ctx: &SagaContext, info: &ReservationInfo) -> SagaResult {
        metrics::counter!("saga_executions_total", "saga" => SagaKind::Reserve.as_str())
            .increment(1);
        let started = Instant::now();
        let mut journal = vec![format!(
            "reserve {} for {}",
            info.car_class, info.customer_name
        )];

        if let Err(e) = info.validate() {
            journal.push(format!("request rejected: {e}"));
            return self
                .finish(ctx, SagaKind::Reserve, info, SagaOutcome::ReservationFailed, journal, started)
                .await;
        }

        let record = self.begin(ctx, SagaKind::Reserve, info, &mut journal).await;

        for phase in FORWARD_PHASES {
            let step = self.forward_step(phase);
            if record.has_completed(step.name()) {
                journal.push(format!("{}: already done before restart", step.name()));
                continue;
            }

            if let Err(e) = ctx.transition(SagaState::Executing(phase)) {
                tracing::warn!(error = %e, "unexpected forward transition");
            }
            tracing::info!(step = step.name(), "saga step started");

            let mut report = self.run_forward(ctx, info, phase).await;
            journal.append(&mut report.journal);

            match report.outcome {
                StepOutcome::Succeeded(_) | StepOutcome::Reconciled(_) => {
                    if let Err(e) = ctx.checkpoints().mark_completed(step.name()).await {
                        tracing::warn!(error = %e, "step completion not recorded");
                    }
                }
                StepOutcome::Degraded => {
                    journal.push(format!("{phase} failed, undoing earlier steps"));
                    let mut compensation = self
                        .compensate_reservation(ctx, info, phase, &record.completed_steps)
                        .await;
                    journal.append(&mut compensation.journal);
                    let outcome = match compensation.status {
                        CompensationStatus::Completed => SagaOutcome::ReservationFailed,
                        CompensationStatus::Failed(stuck) => {
                            journal.push(format!("compensation incomplete: {stuck} still held"));
                            SagaOutcome::ReservationFailed
                        }
                        CompensationStatus::Cancelled(_) => SagaOutcome::Aborted,
                    };
                    return self
                        .finish(ctx, SagaKind::Reserve, info, outcome, journal, started)
                        .await;
                }
                StepOutcome::Cancelled => {
                    return self
                        .finish(ctx, SagaKind::Reserve, info, SagaOutcome::Aborted, journal, started)
                        .await;
                }
            }
        }

        self.finish(ctx, SagaKind::Reserve, info, SagaOutcome::Reserved, journal, started)
            .await
    }

    /// Cancels the booking, then releases the inventory hold.
    ///
    /// Ends `Cancelled` when both took effect, acknowledged or verified, and
    /// `CancellationFailed` when a phase ran out of retries.
    #[tracing::instrument(skip_all, fields(reservation_id = %info.reservation_id, saga = "cancel"))]
    pub async fn cancel(&self, ctx: &SagaContext, info: &ReservationInfo) -> SagaResult {
        metrics::counter!("saga_executions_total", "saga" => SagaKind::Cancel.as_str())
            .increment(1);
        let started = Instant::now();
        let mut journal = vec![format!(
            "cancel reservation of {} for {}",
            info.car_class, info.customer_name
        )];

        if let Err(e) = info.validate() {
            journal.push(format!("request rejected: {e}"));
            return self
                .finish(ctx, SagaKind::Cancel, info, SagaOutcome::CancellationFailed, journal, started)
                .await;
        }

        let record = self.begin(ctx, SagaKind::Cancel, info, &mut journal).await;

        let booking = CancelBooking(&self.booking);
        let inventory = ReleaseInventory(&self.inventory);
        let mut report = self
            .compensation
            .run(ctx, info, &[&booking, &inventory], &record.completed_steps)
            .await;
        journal.append(&mut report.journal);

        let outcome = match report.status {
            CompensationStatus::Completed => SagaOutcome::Cancelled,
            CompensationStatus::Failed(phase) => {
                journal.push(format!("{phase} cancellation gave up, nothing re-booked"));
                SagaOutcome::CancellationFailed
            }
            CompensationStatus::Cancelled(_) => SagaOutcome::Aborted,
        };
        self.finish(ctx, SagaKind::Cancel, info, outcome, journal, started)
            .await
    }

    fn forward_step(&self, phase: Phase) -> &Step<ReservationOperationResult> {
        match phase {
            Phase::Booking => &self.book_car,
            Phase::Inventory => &self.reserve_inventory,
            Phase::Billing => &self.charge_billing,
        }
    }

    async fn run_forward(
        &self,
        ctx: &SagaContext,
        info: &ReservationInfo,
        phase: Phase,
    ) -> StepReport<ReservationOperationResult> {
        let id = info.reservation_id;
        match phase {
            Phase::Booking => {
                self.book_car
                    .run_reconciled(
                        ctx,
                        |invocation| self.booking.reserve(info, invocation),
                        || async move {
                            let state = self.booking.get_reservation(id).await;
                            Reconciliation::from_query(id, state.map(|s| s.is_reserved))
                        },
                    )
                    .await
            }
            Phase::Inventory => {
                self.reserve_inventory
                    .run_reconciled(
                        ctx,
                        |invocation| self.inventory.reserve(info, invocation),
                        || async move {
                            let state = self.inventory.get_state(id).await;
                            Reconciliation::from_query(id, state.map(|s| s.is_reserved))
                        },
                    )
                    .await
            }
            Phase::Billing => {
                self.charge_billing
                    .run_reconciled(
                        ctx,
                        |invocation| self.billing.charge(info, invocation),
                        || async move {
                            let state = self.billing.get_state(id).await;
                            Reconciliation::from_query(id, state.map(|s| s.is_charged))
                        },
                    )
                    .await
            }
        }
    }

    /// Undoes `failed` and every phase before it, newest first.
    async fn compensate_reservation(
        &self,
        ctx: &SagaContext,
        info: &ReservationInfo,
        failed: Phase,
        skip: &[String],
    ) -> CompensationReport {
        let booking = CancelBooking(&self.booking);
        let inventory = ReleaseInventory(&self.inventory);
        let billing = RefundBilling(&self.billing);
        let phases: Vec<&dyn CompensationPhase> = match failed {
            Phase::Booking => vec![&booking],
            Phase::Inventory => vec![&inventory, &booking],
            Phase::Billing => vec![&billing, &inventory, &booking],
        };
        self.compensation.run(ctx, info, &phases, skip).await
    }

    /// Loads the in-flight record of a saga being resumed, or writes a new one.
    async fn begin(
        &self,
        ctx: &SagaContext,
        kind: SagaKind,
        info: &ReservationInfo,
        journal: &mut Vec<String>,
    ) -> InFlightSaga {
        let ledger = ctx.checkpoints();
        match ledger.load_in_flight().await {
            Ok(Some(saga)) if saga.kind == kind && saga.info == *info => {
                journal.push(format!("resumed {kind} saga started at {}", saga.started_at));
                tracing::info!(completed = ?saga.completed_steps, "saga resumed");
                return saga;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "in-flight record unreadable"),
        }

        // Checkpoints left by an abandoned saga must not leak into this one.
        if let Err(e) = ledger.clear_steps(&ALL_STEPS).await {
            tracing::warn!(error = %e, "stale step checkpoints not cleared");
        }
        let saga = InFlightSaga::new(kind, info.clone(), ctx.current_time());
        if let Err(e) = ledger.record_in_flight(&saga).await {
            tracing::warn!(error = %e, "in-flight record not written");
        }
        saga
    }

    async fn finish(
        &self,
        ctx: &SagaContext,
        kind: SagaKind,
        info: &ReservationInfo,
        outcome: SagaOutcome,
        mut journal: Vec<String>,
        started: Instant,
    ) -> SagaResult {
        let terminal = if outcome.is_success() {
            SagaState::Succeeded
        } else {
            SagaState::Failed
        };
        if let Err(e) = ctx.transition(terminal) {
            tracing::warn!(error = %e, "unexpected terminal transition");
        }
        if outcome == SagaOutcome::Aborted {
            journal.push(format!("{kind} saga aborted"));
        }
        journal.push(format!("{kind} saga finished: {outcome}"));

        if let Err(e) = ctx.checkpoints().clear_in_flight().await {
            tracing::warn!(error = %e, "in-flight record not cleared");
        }

        let result = SagaResult::new(outcome, info, &journal);
        if let Err(e) = self.log.append(&result).await {
            tracing::warn!(error = %e, "saga result not written to the audit log");
        }
        ctx.publish(
            &info.customer_name,
            Notification::SagaFinished(result.clone()),
        )
        .await;

        let duration = started.elapsed().as_secs_f64();
        metrics::counter!(
            "saga_completed_total",
            "saga" => kind.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        metrics::histogram!("saga_duration_seconds", "saga" => kind.as_str()).record(duration);
        if outcome.is_success() {
            tracing::info!(%outcome, duration, "saga finished");
        } else {
            tracing::warn!(%outcome, duration, "saga finished");
        }

        result
    }
}
