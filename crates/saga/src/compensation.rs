//! Sequencing of compensating actions.
//!
//! Each phase undoes one earlier step. Phases run one after another through
//! the step executor with a fixed per-attempt timeout. When an attempt goes
//! unanswered the coordinator asks the affected service whether the resource
//! is already released before trying again. The first phase that exhausts
//! its retries stops the run; nothing after it is touched and nothing is
//! re-booked.

use std::time::Duration;

use async_trait::async_trait;
use common::{ReservationId, ReservationInfo, ReservationOperationResult};
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::events::{BOOKING_CANCELLED, INVENTORY_RELEASED};
use crate::retry::StepExecutionOptions;
use crate::services::{BillingService, BookingService, InventoryService};
use crate::state::{Phase, SagaState};
use crate::step::{Invocation, Reconciliation, Step, StepOutcome};

/// Event raised once the billing service has refunded a charge.
pub const BILLING_REFUNDED: &str = "BillingRefunded";

pub const STEP_CANCEL_BOOKING: &str = "cancel_booking";
pub const STEP_RELEASE_INVENTORY: &str = "release_inventory";
pub const STEP_REFUND_BILLING: &str = "refund_billing";

/// Retry configuration of compensation phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationOptions {
    /// Attempt count and delays between attempts.
    pub retry: StepExecutionOptions,
    /// How long each attempt waits for its acknowledgement.
    pub event_timeout: Duration,
}

impl Default for CompensationOptions {
    fn default() -> Self {
        Self {
            retry: StepExecutionOptions::default(),
            event_timeout: Duration::from_secs(30),
        }
    }
}

impl CompensationOptions {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.event_timeout.is_zero() {
            return Err(SagaError::InvalidOptions(
                "event_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One compensating action and the way to verify it took effect.
#[async_trait]
pub trait CompensationPhase: Send + Sync {
    /// Step name, used for checkpoints, notifications and the log.
    fn name(&self) -> &'static str;

    /// Completion event acknowledging the action.
    fn event_name(&self) -> &'static str;

    /// The forward phase this compensates.
    fn phase(&self) -> Phase;

    /// Issues the compensating action.
    async fn compensate(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()>;

    /// Asks the owning service whether the resource is already released.
    async fn is_released(&self, reservation_id: ReservationId) -> Result<bool>;
}

/// Cancels the booking.
pub struct CancelBooking<'a, B: ?Sized>(pub &'a B);

#[async_trait]
impl<'a, B: BookingService + ?Sized> CompensationPhase for CancelBooking<'a, B> {
    fn name(&self) -> &'static str {
        STEP_CANCEL_BOOKING
    }

    fn event_name(&self) -> &'static str {
        BOOKING_CANCELLED
    }

    fn phase(&self) -> Phase {
        Phase::Booking
    }

    async fn compensate(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.0.cancel(info, invocation).await
    }

    async fn is_released(&self, reservation_id: ReservationId) -> Result<bool> {
        Ok(!self.0.get_reservation(reservation_id).await?.is_reserved)
    }
}

/// Releases the car held in inventory.
pub struct ReleaseInventory<'a, I: ?Sized>(pub &'a I);

#[async_trait]
impl<'a, I: InventoryService + ?Sized> CompensationPhase for ReleaseInventory<'a, I> {
    fn name(&self) -> &'static str {
        STEP_RELEASE_INVENTORY
    }

    fn event_name(&self) -> &'static str {
        INVENTORY_RELEASED
    }

    fn phase(&self) -> Phase {
        Phase::Inventory
    }

    async fn compensate(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.0.release(info, invocation).await
    }

    async fn is_released(&self, reservation_id: ReservationId) -> Result<bool> {
        Ok(!self.0.get_state(reservation_id).await?.is_reserved)
    }
}

/// Refunds the charge.
pub struct RefundBilling<'a, P: ?Sized>(pub &'a P);

#[async_trait]
impl<'a, P: BillingService + ?Sized> CompensationPhase for RefundBilling<'a, P> {
    fn name(&self) -> &'static str {
        STEP_REFUND_BILLING
    }

    fn event_name(&self) -> &'static str {
        BILLING_REFUNDED
    }

    fn phase(&self) -> Phase {
        Phase::Billing
    }

    async fn compensate(&self, info: &ReservationInfo, invocation: Invocation) -> Result<()> {
        self.0.refund(info, invocation).await
    }

    async fn is_released(&self, reservation_id: ReservationId) -> Result<bool> {
        Ok(!self.0.get_state(reservation_id).await?.is_charged)
    }
}

/// How a compensation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationStatus {
    /// Every phase succeeded or was reconciled.
    Completed,
    /// The named phase exhausted its retries.
    Failed(Phase),
    /// The run was cancelled during the named phase.
    Cancelled(Phase),
}

#[derive(Debug, Clone)]
pub struct CompensationReport {
    pub status: CompensationStatus,
    /// Phases that finished, in order.
    pub completed: Vec<&'static str>,
    /// Compensating calls made across all phases.
    pub invocations: u32,
    pub journal: Vec<String>,
}

impl CompensationReport {
    pub fn is_success(&self) -> bool {
        self.status == CompensationStatus::Completed
    }
}

/// Runs compensation phases in order.
#[derive(Debug, Clone)]
pub struct CompensationCoordinator {
    options: CompensationOptions,
}

impl CompensationCoordinator {
    pub fn new(options: CompensationOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &CompensationOptions {
        &self.options
    }

    /// Runs `phases` in the given order, skipping those named in `skip`.
    ///
    /// Moves the context through `Compensating(phase)` for each phase run.
    /// Terminal states are left to the caller.
    #[tracing::instrument(skip_all, fields(reservation_id = %info.reservation_id))]
    pub async fn run(
        &self,
        ctx: &SagaContext,
        info: &ReservationInfo,
        phases: &[&dyn CompensationPhase],
        skip: &[String],
    ) -> CompensationReport {
        let mut report = CompensationReport {
            status: CompensationStatus::Completed,
            completed: Vec::new(),
            invocations: 0,
            journal: Vec::new(),
        };

        for &phase in phases {
            if skip.iter().any(|done| done == phase.name()) {
                report
                    .journal
                    .push(format!("{}: already done before restart", phase.name()));
                report.completed.push(phase.name());
                continue;
            }

            if let Err(e) = ctx.transition(SagaState::Compensating(phase.phase())) {
                tracing::warn!(error = %e, "unexpected compensation transition");
            }

            let step = match self.step(phase) {
                Ok(step) => step,
                Err(e) => {
                    report.journal.push(format!("{}: {}", phase.name(), e));
                    report.status = CompensationStatus::Failed(phase.phase());
                    return report;
                }
            };

            let id = info.reservation_id;
            let outcome = step
                .run_reconciled(
                    ctx,
                    |invocation| phase.compensate(info, invocation),
                    || async move { Reconciliation::from_query(id, phase.is_released(id).await) },
                )
                .await;

            report.invocations += outcome.attempts;
            report.journal.extend(outcome.journal);

            match outcome.outcome {
                StepOutcome::Succeeded(_) | StepOutcome::Reconciled(_) => {
                    if let Err(e) = ctx.checkpoints().mark_completed(phase.name()).await {
                        tracing::warn!(error = %e, "phase completion not recorded");
                    }
                    report.completed.push(phase.name());
                }
                StepOutcome::Degraded => {
                    tracing::warn!(phase = phase.name(), "compensation phase failed");
                    report.status = CompensationStatus::Failed(phase.phase());
                    return report;
                }
                StepOutcome::Cancelled => {
                    report.status = CompensationStatus::Cancelled(phase.phase());
                    return report;
                }
            }
        }

        report
    }

    fn step(&self, phase: &dyn CompensationPhase) -> Result<Step<ReservationOperationResult>> {
        Ok(
            Step::new(phase.name(), phase.event_name(), self.options.retry.clone())?
                .with_criteria(|result: &ReservationOperationResult| result.success)
                .with_attempt_timeout(self.options.event_timeout),
        )
    }
}
