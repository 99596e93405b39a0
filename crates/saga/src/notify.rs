//! Best-effort notifications about saga progress.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audit::SagaResult;
use crate::error::{Result, SagaError};

/// Payloads published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    /// A step of the saga finished successfully. Sent to the saga's parent.
    StepCompleted {
        step: String,
        result: serde_json::Value,
    },

    /// The saga reached a terminal state.
    SagaFinished(SagaResult),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::StepCompleted { .. } => "StepCompleted",
            Notification::SagaFinished(_) => "SagaFinished",
        }
    }
}

/// Channel to interested observers.
///
/// Delivery is at-least-once and best effort: the saga logs publish
/// failures and carries on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, recipient: &str, notification: Notification) -> Result<()>;
}

/// Notifier that keeps every publication in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    published: Arc<RwLock<Vec<(String, Notification)>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publication so far, oldest first.
    pub fn published(&self) -> Vec<(String, Notification)> {
        self.published
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Publications addressed to `recipient`.
    pub fn published_to(&self, recipient: &str) -> Vec<Notification> {
        self.published()
            .into_iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, n)| n)
            .collect()
    }

    /// Step completions addressed to `recipient`, as `(step, result)` pairs.
    pub fn step_completions(&self, recipient: &str) -> Vec<(String, serde_json::Value)> {
        self.published_to(recipient)
            .into_iter()
            .filter_map(|n| match n {
                Notification::StepCompleted { step, result } => Some((step, result)),
                Notification::SagaFinished(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, recipient: &str, notification: Notification) -> Result<()> {
        tracing::debug!(recipient, kind = notification.kind(), "notification published");
        self.published
            .write()
            .map_err(|_| SagaError::Notification("publication list poisoned".to_string()))?
            .push((recipient.to_string(), notification));
        Ok(())
    }
}
