//! The saga step primitive: invoke, await the correlated event, evaluate,
//! back off and retry.

use std::future::{Future, Ready};
use std::sync::Arc;
use std::time::Duration;

use common::{AttemptToken, ReservationId, ReservationOperationResult};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::checkpoint::StepCheckpoint;
use crate::context::SagaContext;
use crate::correlation::WaitError;
use crate::error::Result;
use crate::events::{CompletionEvent, CompletionSink};
use crate::retry::StepExecutionOptions;

/// Predicate deciding whether a completion event counts as success.
pub type SuccessCriteria<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// One attempt at a downstream action, as handed to the action.
///
/// The action is expected to report back by sending a completion event
/// named `event_name`, echoing `token`, to `reply_to`.
#[derive(Clone)]
pub struct Invocation {
    pub reservation_id: ReservationId,
    pub step: String,
    pub event_name: String,
    pub attempt: u32,
    pub token: AttemptToken,
    pub reply_to: Arc<dyn CompletionSink>,
}

impl Invocation {
    /// Builds the completion event answering this invocation.
    pub fn completion(&self, result: ReservationOperationResult) -> Result<CompletionEvent> {
        CompletionEvent::operation(&self.event_name, Some(self.token), result)
    }

    /// Sends the completion event answering this invocation.
    pub async fn reply(&self, result: ReservationOperationResult) -> Result<()> {
        let event = self.completion(result)?;
        self.reply_to.deliver(event).await
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("reservation_id", &self.reservation_id)
            .field("step", &self.step)
            .field("event_name", &self.event_name)
            .field("attempt", &self.attempt)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Answer of a direct state query made after an attempt went unanswered.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation<R> {
    /// The downstream system already shows the effect.
    Applied(R),
    /// The effect has not happened.
    NotApplied,
    /// The query itself failed; nothing can be concluded.
    Inconclusive(String),
}

impl Reconciliation<ReservationOperationResult> {
    /// Interprets a yes/no state query about `reservation_id`.
    pub fn from_query(reservation_id: ReservationId, applied: Result<bool>) -> Self {
        match applied {
            Ok(true) => Reconciliation::Applied(ReservationOperationResult::succeeded(reservation_id)),
            Ok(false) => Reconciliation::NotApplied,
            Err(e) => Reconciliation::Inconclusive(e.to_string()),
        }
    }
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<R> {
    /// A completion event satisfied the success criteria.
    Succeeded(R),
    /// No acceptable event, but a state query showed the effect applied.
    Reconciled(R),
    /// Retries exhausted.
    Degraded,
    /// The run was cancelled while the step was in progress.
    Cancelled,
}

/// Outcome of a step plus what happened along the way.
#[derive(Debug, Clone)]
pub struct StepReport<R> {
    pub step: String,
    pub outcome: StepOutcome<R>,
    /// Invocations made, including any made before a restart.
    pub attempts: u32,
    pub journal: Vec<String>,
}

impl<R: Default> StepReport<R> {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Succeeded(_) | StepOutcome::Reconciled(_)
        )
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Degraded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, StepOutcome::Cancelled)
    }

    /// The step's result. A degraded or cancelled step yields `R::default()`,
    /// which callers must not mistake for a real answer.
    pub fn into_result(self) -> R {
        match self.outcome {
            StepOutcome::Succeeded(result) | StepOutcome::Reconciled(result) => result,
            StepOutcome::Degraded | StepOutcome::Cancelled => R::default(),
        }
    }
}

type NoReconciliation<R> = fn() -> Ready<Reconciliation<R>>;

/// A reusable step definition: which event to wait for, how to judge it
/// and how to retry.
pub struct Step<R> {
    name: String,
    event_name: String,
    options: StepExecutionOptions,
    attempt_timeout: Option<Duration>,
    criteria: Option<SuccessCriteria<R>>,
}

impl<R> Step<R>
where
    R: Serialize + DeserializeOwned + Default + Send + Sync,
{
    /// Creates a step, rejecting unusable retry options up front.
    pub fn new(
        name: impl Into<String>,
        event_name: impl Into<String>,
        options: StepExecutionOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            name: name.into(),
            event_name: event_name.into(),
            options,
            attempt_timeout: None,
            criteria: None,
        })
    }

    /// Only events for which `criteria` holds count as success. Without
    /// criteria every event does.
    pub fn with_criteria(mut self, criteria: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.criteria = Some(Arc::new(criteria));
        self
    }

    /// Waits a fixed time per attempt instead of the current retry interval.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn options(&self) -> &StepExecutionOptions {
        &self.options
    }

    /// Runs the step until an acceptable event arrives or retries run out.
    pub async fn run<F, Fut>(&self, ctx: &SagaContext, invoke: F) -> StepReport<R>
    where
        F: FnMut(Invocation) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        self.execute(ctx, invoke, None::<NoReconciliation<R>>).await
    }

    /// Like [`Step::run`], but after every unanswered or rejected attempt
    /// asks `reconcile` whether the effect happened anyway.
    pub async fn run_reconciled<F, Fut, V, VFut>(
        &self,
        ctx: &SagaContext,
        invoke: F,
        reconcile: V,
    ) -> StepReport<R>
    where
        F: FnMut(Invocation) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
        V: FnMut() -> VFut + Send,
        VFut: Future<Output = Reconciliation<R>> + Send,
    {
        self.execute(ctx, invoke, Some(reconcile)).await
    }

    #[tracing::instrument(
        skip_all,
        fields(reservation_id = %ctx.reservation_id(), step = %self.name)
    )]
    async fn execute<F, Fut, V, VFut>(
        &self,
        ctx: &SagaContext,
        mut invoke: F,
        mut reconcile: Option<V>,
    ) -> StepReport<R>
    where
        F: FnMut(Invocation) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
        V: FnMut() -> VFut + Send,
        VFut: Future<Output = Reconciliation<R>> + Send,
    {
        let mut journal = Vec::new();
        let mut attempt = 0u32;

        match ctx.checkpoints().load_step(&self.name).await {
            Ok(Some(checkpoint)) => {
                ctx.correlation().advance_past(checkpoint.token);
                attempt = checkpoint.attempt;
                journal.push(format!("{}: resumed after attempt {}", self.name, attempt));
                tracing::info!(attempt, "step resumed from checkpoint");
                match checkpoint.next_wake_at {
                    Some(wake_at) => {
                        if ctx.create_timer(wake_at).await.is_err() {
                            return self.cancelled(ctx, attempt, journal).await;
                        }
                    }
                    // Stopped while the attempt was still waiting: its answer
                    // is lost, so only the downstream state can settle it.
                    None => {
                        journal.push(format!(
                            "{}: attempt {} was interrupted before its outcome was known",
                            self.name, attempt
                        ));
                        if let Some(reconcile) = reconcile.as_mut()
                            && let Some(result) =
                                self.reconcile_attempt(ctx, reconcile, attempt, &mut journal).await
                        {
                            return self.reconciled(result, attempt, journal);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "checkpoint unreadable, starting fresh"),
        }

        loop {
            if ctx.is_cancelled() {
                return self.cancelled(ctx, attempt, journal).await;
            }
            if attempt > self.options.max_retries {
                return self.exhausted(ctx, attempt, journal).await;
            }

            let bound = self
                .attempt_timeout
                .unwrap_or_else(|| self.options.delay_for_retry(attempt));
            attempt += 1;

            let pending = ctx.expect_event(&self.event_name);
            let token = pending.token();
            self.checkpoint(ctx, attempt, token, None).await;

            metrics::counter!("saga_step_attempts_total", "step" => self.name.clone()).increment(1);
            tracing::info!(attempt, %token, "invoking step");

            let invocation = Invocation {
                reservation_id: ctx.reservation_id(),
                step: self.name.clone(),
                event_name: self.event_name.clone(),
                attempt,
                token,
                reply_to: ctx.reply_to(),
            };

            let failure = match invoke(invocation).await {
                Err(e) => {
                    drop(pending);
                    format!("invocation failed: {e}")
                }
                Ok(()) => match ctx.wait_for_external_event::<R>(pending, bound).await {
                    Ok(result) if self.accepts(&result) => {
                        journal.push(format!(
                            "{} attempt {}: completed successfully",
                            self.name, attempt
                        ));
                        tracing::info!(attempt, "step completed");
                        ctx.notify_step_completed(&self.name, &result).await;
                        self.clear_checkpoint(ctx).await;
                        return StepReport {
                            step: self.name.clone(),
                            outcome: StepOutcome::Succeeded(result),
                            attempts: attempt,
                            journal,
                        };
                    }
                    Ok(_) => "completion event did not meet the success criteria".to_string(),
                    Err(WaitError::Timeout(waited)) => {
                        format!("no completion event within {waited:?}")
                    }
                    Err(WaitError::Cancelled) => {
                        return self.cancelled(ctx, attempt, journal).await;
                    }
                    Err(WaitError::Superseded) => "wait superseded by a newer attempt".to_string(),
                    Err(WaitError::Malformed(e)) => {
                        tracing::warn!(error = %e, "malformed completion payload");
                        format!("malformed completion payload ({e})")
                    }
                },
            };

            journal.push(format!("{} attempt {}: {}", self.name, attempt, failure));
            tracing::warn!(attempt, reason = %failure, "step attempt failed");

            if let Some(reconcile) = reconcile.as_mut()
                && let Some(result) =
                    self.reconcile_attempt(ctx, reconcile, attempt, &mut journal).await
            {
                return self.reconciled(result, attempt, journal);
            }

            if attempt > self.options.max_retries {
                return self.exhausted(ctx, attempt, journal).await;
            }

            let delay = self.options.delay_for_retry(attempt - 1);
            let wake_at = ctx.current_time()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.checkpoint(ctx, attempt, token, Some(wake_at)).await;
            journal.push(format!("{}: retrying in {:?}", self.name, delay));
            tracing::debug!(?delay, "waiting before next attempt");

            if ctx.create_timer(wake_at).await.is_err() {
                return self.cancelled(ctx, attempt, journal).await;
            }
        }
    }

    /// Asks the downstream service whether attempt `attempt` took effect.
    /// Returns the result when it did.
    async fn reconcile_attempt<V, VFut>(
        &self,
        ctx: &SagaContext,
        reconcile: &mut V,
        attempt: u32,
        journal: &mut Vec<String>,
    ) -> Option<R>
    where
        V: FnMut() -> VFut + Send,
        VFut: Future<Output = Reconciliation<R>> + Send,
    {
        metrics::counter!("saga_reconciliations_total", "step" => self.name.clone()).increment(1);
        match reconcile().await {
            Reconciliation::Applied(result) => {
                journal.push(format!(
                    "{}: state query shows the effect already applied",
                    self.name
                ));
                tracing::info!(attempt, "step reconciled from downstream state");
                ctx.notify_step_completed(&self.name, &result).await;
                self.clear_checkpoint(ctx).await;
                Some(result)
            }
            Reconciliation::NotApplied => {
                journal.push(format!("{}: state query shows no effect yet", self.name));
                None
            }
            Reconciliation::Inconclusive(reason) => {
                journal.push(format!(
                    "{}: state query failed ({reason}), inconclusive",
                    self.name
                ));
                None
            }
        }
    }

    fn reconciled(&self, result: R, attempts: u32, journal: Vec<String>) -> StepReport<R> {
        StepReport {
            step: self.name.clone(),
            outcome: StepOutcome::Reconciled(result),
            attempts,
            journal,
        }
    }

    fn accepts(&self, result: &R) -> bool {
        self.criteria.as_ref().is_none_or(|criteria| criteria(result))
    }

    async fn exhausted(
        &self,
        ctx: &SagaContext,
        attempts: u32,
        mut journal: Vec<String>,
    ) -> StepReport<R> {
        journal.push(format!(
            "{}: retries exhausted after {} attempts",
            self.name, attempts
        ));
        tracing::error!(attempts, "step retries exhausted");
        metrics::counter!("saga_step_degraded_total", "step" => self.name.clone()).increment(1);
        self.clear_checkpoint(ctx).await;
        StepReport {
            step: self.name.clone(),
            outcome: StepOutcome::Degraded,
            attempts,
            journal,
        }
    }

    async fn cancelled(
        &self,
        ctx: &SagaContext,
        attempts: u32,
        mut journal: Vec<String>,
    ) -> StepReport<R> {
        journal.push(format!("{}: cancelled", self.name));
        tracing::info!(attempts, "step cancelled");
        self.clear_checkpoint(ctx).await;
        StepReport {
            step: self.name.clone(),
            outcome: StepOutcome::Cancelled,
            attempts,
            journal,
        }
    }

    async fn checkpoint(
        &self,
        ctx: &SagaContext,
        attempt: u32,
        token: AttemptToken,
        next_wake_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let checkpoint = StepCheckpoint {
            step: self.name.clone(),
            attempt,
            token,
            next_wake_at,
        };
        if let Err(e) = ctx.checkpoints().record_step(&checkpoint).await {
            tracing::warn!(error = %e, "checkpoint not written");
        }
    }

    async fn clear_checkpoint(&self, ctx: &SagaContext) {
        if let Err(e) = ctx.checkpoints().clear_step(&self.name).await {
            tracing::warn!(error = %e, "checkpoint not cleared");
        }
    }
}
