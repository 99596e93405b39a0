//! Client side of a reservation entity.

use async_trait::async_trait;
use common::{ReservationId, ReservationInfo};
use saga::{CompletionEvent, CompletionSink, SagaError, SagaKind, SagaResult};
use tokio::sync::{mpsc, oneshot};

use crate::entity::{Command, EntityStatus};
use crate::error::{EntityError, Result};

/// Callable proxy to the entity owning one reservation.
///
/// Cloning is cheap. Every call is queued in the entity's mailbox and
/// handled by that entity alone.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    reservation_id: ReservationId,
    tx: mpsc::Sender<Command>,
}

impl EntityHandle {
    pub(crate) fn new(reservation_id: ReservationId, tx: mpsc::Sender<Command>) -> Self {
        Self { reservation_id, tx }
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    /// Whether the entity behind this handle has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Runs the reservation saga and returns its terminal result.
    ///
    /// Waits behind any saga already running on this reservation.
    pub async fn reserve_car(&self, info: ReservationInfo) -> Result<SagaResult> {
        self.request(|reply| Command::Run {
            kind: SagaKind::Reserve,
            info,
            reply,
        })
        .await?
    }

    /// Runs the cancellation saga and returns its terminal result.
    pub async fn cancel_car_reservation(&self, info: ReservationInfo) -> Result<SagaResult> {
        self.request(|reply| Command::Run {
            kind: SagaKind::Cancel,
            info,
            reply,
        })
        .await?
    }

    /// Delivers a downstream completion event to the entity.
    pub async fn handle_reservation_action_result(&self, event: CompletionEvent) -> Result<()> {
        self.tx
            .send(Command::ActionResult(event))
            .await
            .map_err(|_| EntityError::Stopped(self.reservation_id))
    }

    /// What the entity is doing right now.
    pub async fn status(&self) -> Result<EntityStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Aborts the running saga. Returns `false` when nothing was running.
    pub async fn abort(&self) -> Result<bool> {
        self.request(|reply| Command::Abort { reply }).await
    }

    /// Restarts the saga that was in flight when a previous entity for this
    /// reservation went away. Returns the kind of saga restarted.
    pub async fn resume(&self) -> Result<Option<SagaKind>> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    /// Stops the entity without finishing its saga.
    pub(crate) async fn evict(&self) -> Result<()> {
        self.request(|reply| Command::Evict { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EntityError::Stopped(self.reservation_id))?;
        rx.await.map_err(|_| EntityError::NoReply(self.reservation_id))
    }
}

#[async_trait]
impl CompletionSink for EntityHandle {
    async fn deliver(&self, event: CompletionEvent) -> saga::Result<()> {
        self.handle_reservation_action_result(event)
            .await
            .map_err(|_| SagaError::ReplyChannelClosed(self.reservation_id))
    }
}
