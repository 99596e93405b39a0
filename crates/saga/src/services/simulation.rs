//! Scripted behaviour shared by the in-memory services.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::ReservationOperationResult;

use crate::error::{Result, SagaError};
use crate::step::Invocation;

/// What a simulated service does when an action is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Apply the effect and report success.
    #[default]
    Acknowledge,
    /// Leave state alone and report failure.
    Reject,
    /// Apply the effect but lose the acknowledgement.
    ApplySilently,
    /// Do nothing at all.
    Drop,
    /// Return an error from the call itself.
    Fail,
}

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<&'static str, VecDeque<Behavior>>,
    defaults: HashMap<&'static str, Behavior>,
    calls: HashMap<&'static str, u32>,
    queries: u32,
    fail_queries: bool,
}

/// Per-service script: queued behaviours per operation, a fallback
/// behaviour, call counters and the acknowledgement delay.
#[derive(Debug, Clone)]
pub struct Simulation {
    service: &'static str,
    script: Arc<Mutex<Script>>,
    ack_delay: Duration,
}

impl Simulation {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            script: Arc::new(Mutex::new(Script::default())),
            ack_delay: Duration::ZERO,
        }
    }

    /// Acknowledgements are sent this long after the call returns.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Queues behaviours for the next calls of `operation`, in order.
    pub fn script(&self, operation: &'static str, behaviors: impl IntoIterator<Item = Behavior>) {
        self.lock()
            .queued
            .entry(operation)
            .or_default()
            .extend(behaviors);
    }

    /// Behaviour of `operation` once its queue is empty.
    pub fn set_default(&self, operation: &'static str, behavior: Behavior) {
        self.lock().defaults.insert(operation, behavior);
    }

    /// Makes state queries fail.
    pub fn set_query_failure(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    /// Calls made to `operation` so far.
    pub fn calls(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// State queries made so far.
    pub fn queries(&self) -> u32 {
        self.lock().queries
    }

    /// Runs one action call: picks the behaviour, applies the effect through
    /// `apply` when the behaviour says so, and acknowledges.
    pub(crate) async fn perform(
        &self,
        operation: &'static str,
        invocation: &Invocation,
        apply: impl FnOnce(),
    ) -> Result<()> {
        let behavior = self.next_behavior(operation);
        tracing::debug!(
            service = self.service,
            operation,
            ?behavior,
            attempt = invocation.attempt,
            "simulated call"
        );

        match behavior {
            Behavior::Acknowledge => {
                apply();
                self.acknowledge(invocation, true).await
            }
            Behavior::Reject => self.acknowledge(invocation, false).await,
            Behavior::ApplySilently => {
                apply();
                Ok(())
            }
            Behavior::Drop => Ok(()),
            Behavior::Fail => Err(SagaError::service(
                self.service,
                format!("{operation} unavailable"),
            )),
        }
    }

    /// Counts a state query and fails it when configured to.
    pub(crate) fn query(&self) -> Result<()> {
        let mut script = self.lock();
        script.queries += 1;
        if script.fail_queries {
            return Err(SagaError::service(self.service, "state query failed"));
        }
        Ok(())
    }

    fn next_behavior(&self, operation: &'static str) -> Behavior {
        let mut script = self.lock();
        *script.calls.entry(operation).or_insert(0) += 1;
        let queued = script.queued.get_mut(operation).and_then(VecDeque::pop_front);
        queued
            .or_else(|| script.defaults.get(operation).copied())
            .unwrap_or_default()
    }

    async fn acknowledge(&self, invocation: &Invocation, success: bool) -> Result<()> {
        let result = ReservationOperationResult {
            reservation_id: invocation.reservation_id,
            success,
        };
        let event = invocation.completion(result)?;

        if self.ack_delay.is_zero() {
            return invocation.reply_to.deliver(event).await;
        }

        let reply_to = invocation.reply_to.clone();
        let delay = self.ack_delay;
        let service = self.service;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = reply_to.deliver(event).await {
                tracing::warn!(service, error = %e, "acknowledgement not delivered");
            }
        });
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
