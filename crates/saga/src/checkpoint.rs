//! Write-ahead records that let a saga pick up where it left off.
//!
//! A step records its attempt counter, the token of the attempt in flight
//! and the time it plans to wake up before every suspension. An entity
//! records which saga it is running. Both live in the state store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AttemptToken, ReservationId, ReservationInfo};
use serde::{Deserialize, Serialize};
use state_store::{SaveOptions, StateStore, StateStoreExt};

use crate::error::Result;

/// Progress of one step, written before the step suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub step: String,
    /// Attempts already made.
    pub attempt: u32,
    pub token: AttemptToken,
    /// When the next attempt is due, if the step is between attempts.
    pub next_wake_at: Option<DateTime<Utc>>,
}

/// Which saga an entity was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaKind {
    Reserve,
    Cancel,
}

impl SagaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaKind::Reserve => "reserve",
            SagaKind::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for SagaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A saga that was started and has not reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightSaga {
    pub kind: SagaKind,
    pub info: ReservationInfo,
    pub started_at: DateTime<Utc>,
    /// Steps already finished; a resumed saga skips them.
    #[serde(default)]
    pub completed_steps: Vec<String>,
}

impl InFlightSaga {
    pub fn new(kind: SagaKind, info: ReservationInfo, started_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            info,
            started_at,
            completed_steps: Vec::new(),
        }
    }

    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }
}

/// Checkpoint storage for one reservation.
#[derive(Clone)]
pub struct CheckpointLedger {
    store: Arc<dyn StateStore>,
    reservation_id: ReservationId,
}

impl CheckpointLedger {
    pub fn new(store: Arc<dyn StateStore>, reservation_id: ReservationId) -> Self {
        Self {
            store,
            reservation_id,
        }
    }

    fn step_key(&self, step: &str) -> String {
        format!("{}||{}||checkpoint", self.reservation_id, step)
    }

    fn in_flight_key(&self) -> String {
        format!("{}||in-flight", self.reservation_id)
    }

    pub async fn load_step(&self, step: &str) -> Result<Option<StepCheckpoint>> {
        Ok(self
            .store
            .get_json(&self.step_key(step))
            .await?
            .map(|(checkpoint, _)| checkpoint))
    }

    pub async fn record_step(&self, checkpoint: &StepCheckpoint) -> Result<()> {
        self.store
            .save_json(&self.step_key(&checkpoint.step), checkpoint, SaveOptions::new())
            .await?;
        Ok(())
    }

    pub async fn clear_step(&self, step: &str) -> Result<()> {
        self.store.delete_state(&self.step_key(step)).await?;
        Ok(())
    }

    /// Drops the checkpoints of `steps`, e.g. ones left by an abandoned saga.
    pub async fn clear_steps(&self, steps: &[&str]) -> Result<()> {
        for step in steps {
            self.clear_step(step).await?;
        }
        Ok(())
    }

    pub async fn load_in_flight(&self) -> Result<Option<InFlightSaga>> {
        Ok(self
            .store
            .get_json(&self.in_flight_key())
            .await?
            .map(|(saga, _)| saga))
    }

    pub async fn record_in_flight(&self, saga: &InFlightSaga) -> Result<()> {
        self.store
            .save_json(&self.in_flight_key(), saga, SaveOptions::new())
            .await?;
        Ok(())
    }

    /// Notes in the in-flight record that `step` finished. Does nothing when
    /// no saga is recorded.
    pub async fn mark_completed(&self, step: &str) -> Result<()> {
        let Some(mut saga) = self.load_in_flight().await? else {
            return Ok(());
        };
        if !saga.has_completed(step) {
            saga.completed_steps.push(step.to_string());
            self.record_in_flight(&saga).await?;
        }
        Ok(())
    }

    pub async fn clear_in_flight(&self) -> Result<()> {
        self.store.delete_state(&self.in_flight_key()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store::InMemoryStateStore;

    #[tokio::test]
    async fn test_step_checkpoint_lifecycle() {
        let id = ReservationId::new();
        let ledger = CheckpointLedger::new(Arc::new(InMemoryStateStore::new()), id);
        assert!(ledger.load_step("cancel_booking").await.unwrap().is_none());

        let checkpoint = StepCheckpoint {
            step: "cancel_booking".to_string(),
            attempt: 2,
            token: AttemptToken::new(7),
            next_wake_at: Some(Utc::now()),
        };
        ledger.record_step(&checkpoint).await.unwrap();
        assert_eq!(
            ledger.load_step("cancel_booking").await.unwrap(),
            Some(checkpoint)
        );
        assert!(ledger.load_step("release_inventory").await.unwrap().is_none());

        ledger.clear_step("cancel_booking").await.unwrap();
        assert!(ledger.load_step("cancel_booking").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_record_is_per_reservation() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let info = ReservationInfo::generate("Alice", "SUV").unwrap();
        let ledger = CheckpointLedger::new(store.clone(), info.reservation_id);
        let other = CheckpointLedger::new(store, ReservationId::new());

        let mut saga = InFlightSaga::new(SagaKind::Cancel, info, Utc::now());
        saga.completed_steps.push("cancel_booking".to_string());
        ledger.record_in_flight(&saga).await.unwrap();

        let loaded = ledger.load_in_flight().await.unwrap().unwrap();
        assert!(loaded.has_completed("cancel_booking"));
        assert!(!loaded.has_completed("release_inventory"));
        assert_eq!(loaded, saga);
        assert!(other.load_in_flight().await.unwrap().is_none());

        ledger.mark_completed("release_inventory").await.unwrap();
        ledger.mark_completed("release_inventory").await.unwrap();
        let loaded = ledger.load_in_flight().await.unwrap().unwrap();
        assert_eq!(
            loaded.completed_steps,
            vec!["cancel_booking".to_string(), "release_inventory".to_string()]
        );

        ledger.clear_in_flight().await.unwrap();
        assert!(ledger.load_in_flight().await.unwrap().is_none());
        ledger.mark_completed("cancel_booking").await.unwrap();
        assert!(ledger.load_in_flight().await.unwrap().is_none());
    }
}
