//! The single owner of one reservation.
//!
//! An entity is a task with a mailbox. Commands are handled one at a time
//! in receipt order. A saga runs as a child task so the entity keeps
//! routing completion events into it while it waits; sagas requested while
//! one is running are queued and start in order once it finishes.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ReservationId, ReservationInfo};
use saga::{
    BillingService, BookingService, CheckpointLedger, CompletionEvent, CompletionSink,
    CorrelationRegistry, Delivery, InventoryService, Notifier, ReservationSaga, SagaContext,
    SagaError, SagaKind, SagaOutcome, SagaResult, SagaState,
};
use state_store::StateStore;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{EntityError, Result};

type SagaReply = oneshot::Sender<Result<SagaResult>>;

/// Messages understood by an entity.
#[derive(Debug)]
pub(crate) enum Command {
    Run {
        kind: SagaKind,
        info: ReservationInfo,
        reply: SagaReply,
    },
    ActionResult(CompletionEvent),
    Status {
        reply: oneshot::Sender<EntityStatus>,
    },
    Abort {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<Result<Option<SagaKind>>>,
    },
    Evict {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::ActionResult(_) => "action_result",
            Command::Status { .. } => "status",
            Command::Abort { .. } => "abort",
            Command::Resume { .. } => "resume",
            Command::Evict { .. } => "evict",
        }
    }
}

/// Snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus {
    pub reservation_id: ReservationId,
    /// The saga currently running, if any.
    pub running: Option<SagaKind>,
    /// State of the running saga, or of the last one to finish.
    pub state: SagaState,
    /// Sagas waiting for the running one.
    pub queued: usize,
    pub last_outcome: Option<SagaOutcome>,
}

/// Reply address handed to downstream services. Holds the mailbox weakly
/// so an entity nobody addresses any more can stop.
struct MailboxSink {
    reservation_id: ReservationId,
    tx: mpsc::WeakSender<Command>,
}

#[async_trait]
impl CompletionSink for MailboxSink {
    async fn deliver(&self, event: CompletionEvent) -> saga::Result<()> {
        let tx = self
            .tx
            .upgrade()
            .ok_or(SagaError::ReplyChannelClosed(self.reservation_id))?;
        tx.send(Command::ActionResult(event))
            .await
            .map_err(|_| SagaError::ReplyChannelClosed(self.reservation_id))
    }
}

struct Running {
    kind: SagaKind,
    cancel: CancellationToken,
    state: watch::Receiver<SagaState>,
    reply: Option<SagaReply>,
    task: JoinHandle<SagaResult>,
}

struct Queued {
    kind: SagaKind,
    info: ReservationInfo,
    reply: Option<SagaReply>,
}

enum Event {
    Command(Option<Command>),
    Finished(std::result::Result<SagaResult, JoinError>),
}

/// Owner of one reservation's sagas.
pub struct ReservationEntity<B, I, P> {
    reservation_id: ReservationId,
    saga: Arc<ReservationSaga<B, I, P>>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    correlation: Arc<CorrelationRegistry>,
    reply_to: Arc<dyn CompletionSink>,
    mailbox: mpsc::Receiver<Command>,
    running: Option<Running>,
    queue: VecDeque<Queued>,
    last_state: SagaState,
    last_outcome: Option<SagaOutcome>,
}

impl<B, I, P> ReservationEntity<B, I, P>
where
    B: BookingService + 'static,
    I: InventoryService + 'static,
    P: BillingService + 'static,
{
    /// Creates an entity and the sender feeding its mailbox.
    pub(crate) fn new(
        reservation_id: ReservationId,
        saga: Arc<ReservationSaga<B, I, P>>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        mailbox_capacity: usize,
    ) -> (Self, mpsc::Sender<Command>) {
        let (tx, mailbox) = mpsc::channel(mailbox_capacity);
        let reply_to = Arc::new(MailboxSink {
            reservation_id,
            tx: tx.downgrade(),
        });
        let entity = Self {
            reservation_id,
            saga,
            store,
            notifier,
            correlation: Arc::new(CorrelationRegistry::new(reservation_id)),
            reply_to,
            mailbox,
            running: None,
            queue: VecDeque::new(),
            last_state: SagaState::Start,
            last_outcome: None,
        };
        (entity, tx)
    }

    /// Handles commands until evicted or until every handle is dropped.
    /// The registry holds a handle, so its entities run until evicted.
    #[tracing::instrument(skip_all, fields(reservation_id = %self.reservation_id))]
    pub(crate) async fn run(mut self) {
        tracing::debug!("entity started");
        loop {
            let event = tokio::select! {
                command = self.mailbox.recv() => Event::Command(command),
                finished = Self::join(&mut self.running) => Event::Finished(finished),
            };

            match event {
                Event::Command(Some(command)) => {
                    metrics::counter!("entity_mailbox_messages_total", "command" => command.kind())
                        .increment(1);
                    if !self.handle(command).await {
                        break;
                    }
                }
                Event::Command(None) => {
                    self.stop();
                    break;
                }
                Event::Finished(result) => {
                    self.finished(result);
                    self.start_next();
                }
            }
        }
        tracing::debug!("entity stopped");
    }

    /// Returns `false` when the entity should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Run { kind, info, reply } => {
                if info.reservation_id != self.reservation_id {
                    let _ = reply.send(Err(EntityError::WrongReservation {
                        entity: self.reservation_id,
                        received: info.reservation_id,
                    }));
                    return true;
                }
                self.enqueue(kind, info, Some(reply));
            }
            Command::ActionResult(event) => self.route(event),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Abort { reply } => {
                let aborted = match &self.running {
                    Some(running) => {
                        tracing::info!(saga = %running.kind, "aborting saga");
                        running.cancel.cancel();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(aborted);
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            Command::Evict { reply } => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn route(&self, event: CompletionEvent) {
        if event.reservation_id != self.reservation_id {
            tracing::warn!(received = %event.reservation_id, "completion event for another reservation dropped");
            return;
        }
        match self.correlation.route(event) {
            Delivery::Delivered => {}
            Delivery::Stale { active, received } => {
                tracing::debug!(%active, %received, "stale completion event ignored");
            }
            Delivery::Unexpected => tracing::debug!("unexpected completion event ignored"),
        }
    }

    fn enqueue(&mut self, kind: SagaKind, info: ReservationInfo, reply: Option<SagaReply>) {
        self.queue.push_back(Queued { kind, info, reply });
        if self.running.is_none() {
            self.start_next();
        } else {
            tracing::debug!(saga = %kind, queued = self.queue.len(), "saga queued");
        }
    }

    fn start_next(&mut self) {
        if self.running.is_some() {
            return;
        }
        let Some(next) = self.queue.pop_front() else {
            return;
        };

        let cancel = CancellationToken::new();
        let ctx = SagaContext::with_reply_to(
            self.correlation.clone(),
            self.reply_to.clone(),
            self.store.clone(),
            self.notifier.clone(),
        )
        .with_cancellation(cancel.clone());
        let state = ctx.subscribe_state();

        let saga = self.saga.clone();
        let kind = next.kind;
        let info = next.info;
        let task = tokio::spawn(async move {
            match kind {
                SagaKind::Reserve => saga.reserve(&ctx, &info).await,
                SagaKind::Cancel => saga.cancel(&ctx, &info).await,
            }
        });

        tracing::info!(saga = %kind, "saga started");
        self.running = Some(Running {
            kind,
            cancel,
            state,
            reply: next.reply,
            task,
        });
    }

    fn finished(&mut self, result: std::result::Result<SagaResult, JoinError>) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.last_state = *running.state.borrow();

        let reply = match result {
            Ok(result) => {
                self.last_outcome = Some(result.outcome);
                Ok(result)
            }
            Err(e) => {
                tracing::error!(saga = %running.kind, error = %e, "saga task failed");
                Err(EntityError::SagaPanicked(self.reservation_id))
            }
        };
        if let Some(tx) = running.reply {
            let _ = tx.send(reply);
        }
    }

    async fn resume(&mut self) -> Result<Option<SagaKind>> {
        if self.running.is_some() {
            return Ok(None);
        }
        let ledger = CheckpointLedger::new(self.store.clone(), self.reservation_id);
        let Some(saga) = ledger.load_in_flight().await? else {
            return Ok(None);
        };
        tracing::info!(saga = %saga.kind, "resuming saga");
        self.enqueue(saga.kind, saga.info, None);
        Ok(Some(saga.kind))
    }

    /// Drops the running saga where it stands. Its in-flight record stays so
    /// a later entity can resume it.
    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            tracing::info!(saga = %running.kind, "saga abandoned");
            running.task.abort();
        }
        self.queue.clear();
    }

    fn status(&self) -> EntityStatus {
        let (running, state) = match &self.running {
            Some(running) => (Some(running.kind), *running.state.borrow()),
            None => (None, self.last_state),
        };
        EntityStatus {
            reservation_id: self.reservation_id,
            running,
            state,
            queued: self.queue.len(),
            last_outcome: self.last_outcome,
        }
    }

    async fn join(running: &mut Option<Running>) -> std::result::Result<SagaResult, JoinError> {
        match running {
            Some(running) => (&mut running.task).await,
            None => std::future::pending().await,
        }
    }
}
