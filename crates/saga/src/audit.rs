//! Terminal saga records and the per-reservation audit trail.

use std::sync::Arc;
use std::time::Duration;

use common::{ReservationId, ReservationInfo};
use serde::{Deserialize, Serialize};
use state_store::{SaveOptions, StateStore, StateStoreError, StateStoreExt, Version};

use crate::error::Result;

/// Placed between the logs of consecutive sagas on one reservation.
pub const LOG_SEPARATOR: &str = "\n----------\n";

/// How long an audit trail stays readable after its last write.
pub const DEFAULT_LOG_TTL: Duration = Duration::from_secs(15 * 60);

const MAX_CONFLICT_RETRIES: u32 = 5;

/// How a saga ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaOutcome {
    /// Booking, inventory and billing all went through.
    Reserved,
    /// A reservation step failed; earlier steps were compensated.
    ReservationFailed,
    /// Booking and inventory were released.
    Cancelled,
    /// A cancellation phase exhausted its retries.
    CancellationFailed,
    /// The saga was stopped from outside before finishing.
    Aborted,
}

impl SagaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SagaOutcome::Reserved | SagaOutcome::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaOutcome::Reserved => "Reserved",
            SagaOutcome::ReservationFailed => "ReservationFailed",
            SagaOutcome::Cancelled => "Cancelled",
            SagaOutcome::CancellationFailed => "CancellationFailed",
            SagaOutcome::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for SagaOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal record of a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaResult {
    pub outcome: SagaOutcome,
    pub reservation_id: ReservationId,
    /// Human-readable account of every attempt, oldest first.
    pub log: String,
    pub customer_name: String,
    pub car_class: String,
}

impl SagaResult {
    pub fn new(outcome: SagaOutcome, info: &ReservationInfo, journal: &[String]) -> Self {
        Self {
            outcome,
            reservation_id: info.reservation_id,
            log: journal.join("\n"),
            customer_name: info.customer_name.clone(),
            car_class: info.car_class.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Accumulates saga results per reservation in a [`StateStore`].
///
/// Writes are compare-and-swap on the stored version, so a reserve and a
/// cancel finishing at the same time both land in the trail.
#[derive(Clone)]
pub struct SagaLog {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl SagaLog {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_LOG_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(reservation_id: ReservationId) -> String {
        format!("{reservation_id}||saga-log")
    }

    /// Reads the accumulated record for a reservation.
    pub async fn read(&self, reservation_id: ReservationId) -> Result<Option<SagaResult>> {
        Ok(self
            .store
            .get_json(&Self::key(reservation_id))
            .await?
            .map(|(result, _)| result))
    }

    /// Appends `result` to the reservation's trail and returns the merged
    /// record.
    ///
    /// Appending a result whose log already ends the trail changes nothing.
    #[tracing::instrument(skip(self, result), fields(reservation_id = %result.reservation_id))]
    pub async fn append(&self, result: &SagaResult) -> Result<SagaResult> {
        let key = Self::key(result.reservation_id);
        let mut conflicts = 0;

        loop {
            let (merged, expected) = match self.store.get_json::<SagaResult>(&key).await? {
                Some((stored, version)) => {
                    if Self::already_recorded(&stored.log, &result.log) {
                        tracing::debug!("saga result already recorded");
                        return Ok(stored);
                    }
                    let mut merged = result.clone();
                    merged.log = format!("{}{}{}", stored.log, LOG_SEPARATOR, result.log);
                    (merged, version)
                }
                None => (result.clone(), Version::initial()),
            };

            let options = SaveOptions::expect_version(expected).with_ttl(self.ttl);
            match self.store.save_json(&key, &merged, options).await {
                Ok(_) => return Ok(merged),
                Err(StateStoreError::ConcurrencyConflict { .. })
                    if conflicts < MAX_CONFLICT_RETRIES =>
                {
                    conflicts += 1;
                    tracing::debug!(conflicts, "audit log changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn already_recorded(trail: &str, log: &str) -> bool {
        trail == log
            || trail
                .strip_suffix(log)
                .is_some_and(|head| head.ends_with(LOG_SEPARATOR))
    }
}
