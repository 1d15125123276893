//! Entity process loop and its async handle.
//!
//! Each entity runs as one tokio task that exclusively owns the entity's
//! state and last sequence number. Commands arrive over a bounded `mpsc`
//! mailbox and are processed strictly one at a time: decide, append to the
//! journal, fold, reply. Snapshot requests are handed to a per-entity
//! snapshot worker so they never delay a reply.
//!
//! Public API: [`EntityHandle`] (cloneable async handle) and
//! [`spawn_entity`] (recovers the entity, then starts its task).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::command::CommandContext;
use crate::config::EntityConfig;
use crate::entity::{Effect, Entity, EntityId, SequenceNumber, fold};
use crate::error::{EngineError, JournalError, RecoveryError};
use crate::event::encode_events;
use crate::journal::Journal;
use crate::policy::{SnapshotPolicy, SnapshotTracker};
use crate::recovery::recover;
use crate::snapshot::{SnapshotRecord, SnapshotStore};

/// Result type sent back through the `Submit` reply channel.
type SubmitResult<E> = Result<<E as Entity>::Reply, EngineError<<E as Entity>::Error>>;

/// Messages sent from [`EntityHandle`] to the entity process.
pub(crate) enum EntityMessage<E: Entity> {
    /// Run a command through the command handler.
    Submit {
        cmd: E::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<SubmitResult<E>>,
    },

    /// Read the current state and last sequence number.
    Inspect {
        reply: oneshot::Sender<(E, SequenceNumber)>,
    },
}

/// What the loop does after a command has been handled.
enum Outcome<E: Entity> {
    /// Reply and carry on; nothing was persisted.
    Done(SubmitResult<E>),
    /// Reply, then let the snapshot policy observe `count` new events.
    Persisted { result: SubmitResult<E>, count: u64 },
    /// Reply, then stop: the in-memory sequence is no longer authoritative.
    Fatal(SubmitResult<E>),
}

/// State shared between every clone of a handle and the running task.
struct Shared {
    /// Set once a stop is requested or the loop has exited.
    stopping: AtomicBool,
    /// Sends `true` to ask the loop to stop after the in-flight command.
    shutdown_tx: watch::Sender<bool>,
    /// The spawned task, taken and awaited once by [`EntityHandle::stop`].
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A snapshot to be written by the snapshot worker.
struct SnapshotRequest<E> {
    sequence: SequenceNumber,
    state: E,
}

/// Background task writing snapshots and pruning old ones for one entity.
struct SnapshotWorker<E> {
    tx: mpsc::Sender<SnapshotRequest<E>>,
    task: JoinHandle<()>,
}

impl<E: Entity> SnapshotWorker<E> {
    fn spawn(
        entity_id: EntityId,
        store: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(run_snapshot_worker::<E>(entity_id, store, policy, rx));
        Self { tx, task }
    }

    /// Queue a snapshot without waiting. A full queue drops the request.
    fn request(&self, entity_id: &EntityId, sequence: SequenceNumber, state: E) {
        if let Err(e) = self.tx.try_send(SnapshotRequest { sequence, state }) {
            let reason = match e {
                TrySendError::Full(_) => "queue full",
                TrySendError::Closed(_) => "worker gone",
            };
            tracing::warn!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %entity_id,
                sequence,
                reason,
                "snapshot request dropped; deferring to next threshold"
            );
        }
    }

    /// Stop accepting requests and wait for queued ones to be written.
    async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "snapshot worker panicked");
        }
    }
}

/// Save each requested snapshot, then prune beyond the retention count.
///
/// Failures are logged and never propagate to commands.
async fn run_snapshot_worker<E: Entity>(
    entity_id: EntityId,
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    mut rx: mpsc::Receiver<SnapshotRequest<E>>,
) {
    while let Some(SnapshotRequest { sequence, state }) = rx.recv().await {
        let record = match SnapshotRecord::capture(entity_id.clone(), sequence, &state) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity_id,
                    sequence,
                    error = %e,
                    "failed to serialize snapshot"
                );
                continue;
            }
        };

        if let Err(e) = store.save(record).await {
            tracing::warn!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %entity_id,
                sequence,
                error = %e,
                "failed to save snapshot"
            );
            continue;
        }
        tracing::debug!(entity_id = %entity_id, sequence, "snapshot saved");

        let pruned = match store.list(&entity_id).await {
            Ok(sequences) => match policy.retention_cutoff(&sequences) {
                Some(cutoff) => store.delete_older_than(&entity_id, cutoff).await,
                None => Ok(0),
            },
            Err(e) => Err(e),
        };
        match pruned {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(entity_id = %entity_id, removed, "old snapshots pruned");
            }
            Err(e) => {
                tracing::warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity_id,
                    error = %e,
                    "failed to prune old snapshots"
                );
            }
        }
    }
}

/// The sequential worker that owns one entity.
struct EntityProcess<E: Entity> {
    entity_id: EntityId,
    state: E,
    last_sequence: SequenceNumber,
    journal: Arc<dyn Journal>,
    tracker: SnapshotTracker,
    snapshots: Option<SnapshotWorker<E>>,
}

impl<E: Entity> EntityProcess<E> {
    /// Process messages until stopped, the mailbox closes, or a conflict.
    ///
    /// On exit every queued command is answered with
    /// [`EngineError::Stopped`] and pending snapshots are flushed.
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<EntityMessage<E>>,
        mut shutdown_rx: watch::Receiver<bool>,
        shared: Arc<Shared>,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                msg = rx.recv() => msg,
            };
            // Channel closed: all handles dropped.
            let Some(msg) = msg else { break };

            match msg {
                EntityMessage::Submit { cmd, ctx, reply } => {
                    let span = tracing::info_span!(
                        "submit",
                        entity_type = E::ENTITY_TYPE,
                        entity_id = %self.entity_id,
                    );
                    let outcome = self.handle_command(cmd, &ctx).instrument(span).await;
                    match outcome {
                        Outcome::Done(result) => {
                            // A dropped receiver means the caller gave up waiting.
                            let _ = reply.send(result);
                        }
                        Outcome::Persisted { result, count } => {
                            let _ = reply.send(result);
                            self.after_persist(count);
                        }
                        Outcome::Fatal(result) => {
                            let _ = reply.send(result);
                            break;
                        }
                    }
                }

                EntityMessage::Inspect { reply } => {
                    let _ = reply.send((self.state.clone(), self.last_sequence));
                }
            }
        }

        shared.stopping.store(true, Ordering::Release);
        rx.close();
        let mut rejected = 0usize;
        while let Some(msg) = rx.recv().await {
            if let EntityMessage::Submit { reply, .. } = msg {
                let _ = reply.send(Err(EngineError::Stopped));
                rejected += 1;
            }
        }

        if let Some(worker) = self.snapshots.take() {
            worker.finish().await;
        }

        tracing::info!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %self.entity_id,
            last_sequence = self.last_sequence,
            rejected,
            "entity process stopped"
        );
    }

    /// Decide, persist, fold and build the reply for one command.
    async fn handle_command(&mut self, cmd: E::Command, ctx: &CommandContext) -> Outcome<E> {
        let (events, reply) = match self.state.handle(cmd) {
            Effect::Reject(err) => return Outcome::Done(Err(EngineError::ValidationRejected(err))),
            Effect::Reply(value) => return Outcome::Done(Ok(value)),
            Effect::Persist { events, reply } => (events, reply),
        };

        if events.is_empty() {
            return Outcome::Done(Ok(reply(&self.state)));
        }

        let encoded = match encode_events::<E>(&events, ctx) {
            Ok(encoded) => encoded,
            Err(e) => {
                return Outcome::Done(Err(EngineError::PersistenceFailure(
                    JournalError::Serialization(e),
                )));
            }
        };

        let expected = self.last_sequence;
        if let Err(err) = self
            .journal
            .append(&self.entity_id, expected, encoded)
            .await
        {
            return match EngineError::from_append(err) {
                conflict @ EngineError::Conflict { actual, .. } => {
                    tracing::error!(
                        expected,
                        actual,
                        "journal advanced by another writer; stopping entity process"
                    );
                    Outcome::Fatal(Err(conflict))
                }
                other => {
                    tracing::warn!(error = %other, "journal append failed; state unchanged");
                    Outcome::Done(Err(other))
                }
            };
        }

        let count = events.len() as u64;
        self.state = fold(self.state.clone(), &events);
        self.last_sequence = expected + count;
        tracing::info!(count, last_sequence = self.last_sequence, "events appended");

        Outcome::Persisted {
            result: Ok(reply(&self.state)),
            count,
        }
    }

    /// Let the snapshot policy observe a persisted batch.
    fn after_persist(&mut self, count: u64) {
        if !self.tracker.record(count) {
            return;
        }
        if let Some(worker) = &self.snapshots {
            worker.request(&self.entity_id, self.last_sequence, self.state.clone());
        }
    }
}

/// Async handle to a running entity process.
///
/// Lightweight, cloneable, and `Send + Sync`. Every clone talks to the same
/// process.
pub struct EntityHandle<E: Entity> {
    entity_id: EntityId,
    sender: mpsc::Sender<EntityMessage<E>>,
    shared: Arc<Shared>,
}

// Manual `Clone` because `E` itself need not be cloned for the handle.
impl<E: Entity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<E: Entity> EntityHandle<E> {
    /// Id of the entity this handle controls.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Submit a command and wait for its reply.
    ///
    /// # Errors
    ///
    /// * [`EngineError::ValidationRejected`] -- the command handler declined it.
    /// * [`EngineError::PersistenceFailure`] -- the journal append failed.
    /// * [`EngineError::Conflict`] -- another writer advanced the journal; the
    ///   process has stopped.
    /// * [`EngineError::Overloaded`] -- the mailbox is full.
    /// * [`EngineError::Stopped`] -- the process is stopping or gone.
    pub async fn submit(&self, cmd: E::Command) -> SubmitResult<E> {
        self.submit_with(cmd, CommandContext::default()).await
    }

    /// Submit a command with metadata stamped onto the events it produces.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub async fn submit_with(&self, cmd: E::Command, ctx: CommandContext) -> SubmitResult<E> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .try_send(EntityMessage::Submit { cmd, ctx, reply: tx })
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Overloaded,
                TrySendError::Closed(_) => EngineError::Stopped,
            })?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Read the current state.
    ///
    /// The query is queued behind every previously submitted command.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the process is gone.
    pub async fn state(&self) -> Result<E, EngineError<E::Error>> {
        self.inspect().await.map(|(state, _)| state)
    }

    /// Read the sequence number of the last persisted event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the process is gone.
    pub async fn last_sequence(&self) -> Result<SequenceNumber, EngineError<E::Error>> {
        self.inspect().await.map(|(_, seq)| seq)
    }

    async fn inspect(&self) -> Result<(E, SequenceNumber), EngineError<E::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::Inspect { reply: tx })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Check whether the process is still accepting commands.
    ///
    /// Returns `false` once a stop was requested or the process exited
    /// (for example after a conflict).
    pub fn is_alive(&self) -> bool {
        !self.shared.stopping.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Stop the process gracefully.
    ///
    /// The in-flight command finishes; queued and later submissions fail
    /// with [`EngineError::Stopped`]; pending snapshots are written before
    /// this returns. Calling `stop` more than once is safe, and every caller,
    /// concurrent ones included, returns only after the task has exited.
    pub async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        // The receiver is gone if the loop already exited.
        let _ = self.shared.shutdown_tx.send(true);

        // Held across the join so later callers wait for the first one.
        let mut slot = self.shared.task.lock().await;
        if let Some(task) = slot.take() {
            if let Err(e) = task.await {
                tracing::error!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %self.entity_id,
                    error = %e,
                    "entity process panicked"
                );
            }
        }
    }
}

/// Recover an entity and start its process.
///
/// Recovery completes before the process accepts its first command; if it
/// fails the process never starts.
///
/// # Arguments
///
/// * `entity_id` - Identity of the entity.
/// * `empty_state` - State before any event has been applied.
/// * `journal` - Event log shared across entities.
/// * `snapshots` - Snapshot store shared across entities.
/// * `config` - Mailbox size and snapshot policy.
///
/// # Errors
///
/// Returns [`RecoveryError`] if the snapshot store or journal cannot be read,
/// or the journal is inconsistent.
pub async fn spawn_entity<E: Entity>(
    entity_id: EntityId,
    empty_state: E,
    journal: Arc<dyn Journal>,
    snapshots: Arc<dyn SnapshotStore>,
    config: EntityConfig,
) -> Result<EntityHandle<E>, RecoveryError> {
    let recovered = recover(&entity_id, empty_state, journal.as_ref(), snapshots.as_ref()).await?;

    let (tx, rx) = mpsc::channel(config.effective_mailbox_capacity());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        stopping: AtomicBool::new(false),
        shutdown_tx,
        task: Mutex::new(None),
    });

    let worker = config.snapshot.is_enabled().then(|| {
        SnapshotWorker::spawn(
            entity_id.clone(),
            snapshots,
            config.snapshot,
            config.effective_snapshot_queue_capacity(),
        )
    });

    let process = EntityProcess {
        entity_id: entity_id.clone(),
        state: recovered.state,
        last_sequence: recovered.last_sequence,
        journal,
        tracker: SnapshotTracker::new(config.snapshot, recovered.replayed_events),
        snapshots: worker,
    };

    let task = tokio::spawn(process.run(rx, shutdown_rx, Arc::clone(&shared)));
    *shared.task.lock().await = Some(task);

    tracing::debug!(
        entity_type = E::ENTITY_TYPE,
        entity_id = %entity_id,
        last_sequence = recovered.last_sequence,
        "entity process started"
    );

    Ok(EntityHandle {
        entity_id,
        sender: tx,
        shared,
    })
}
