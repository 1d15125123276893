//! Crate-level error types for command submission, recovery, and storage.

use crate::entity::{EntityId, SequenceNumber};

/// Error returned by a [`Journal`](crate::Journal) operation.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Another writer already moved the entity past the expected sequence.
    ///
    /// Guards against two live processes for the same entity.
    #[error("journal conflict for {entity_id}: expected last sequence {expected}, found {actual}")]
    Conflict {
        /// Entity whose append was refused.
        entity_id: EntityId,
        /// Sequence number the writer believed was last.
        expected: SequenceNumber,
        /// Sequence number actually stored.
        actual: SequenceNumber,
    },

    /// Disk I/O failure.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event or record could not be (de)serialized.
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data is unreadable or out of order.
    #[error("journal for {entity_id} is corrupt: {detail}")]
    Corrupt {
        /// Entity whose journal is damaged.
        entity_id: EntityId,
        /// What was wrong with it.
        detail: String,
    },

    /// The backing store cannot be reached (timeouts, remote outages).
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by a [`SnapshotStore`](crate::SnapshotStore) operation.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Disk I/O failure.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot could not be (de)serialized.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store cannot be reached.
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Error returned when an entity's state cannot be rebuilt at startup.
///
/// The entity process never starts when recovery fails.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Reading the journal failed.
    #[error("recovery failed reading journal: {0}")]
    Journal(#[from] JournalError),

    /// Loading the latest snapshot failed.
    #[error("recovery failed loading snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A journal record did not decode into the entity's event type.
    #[error("recovery failed decoding event {sequence}: {source}")]
    Decode {
        /// Sequence number of the undecodable event.
        sequence: SequenceNumber,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// The journal skipped or repeated a sequence number.
    #[error("recovery found a sequence gap: expected {expected}, found {found}")]
    SequenceGap {
        /// Sequence number that should have come next.
        expected: SequenceNumber,
        /// Sequence number that was read instead.
        found: SequenceNumber,
    },
}

/// Error returned by [`EntityRegistry::spawn_or_recover`](crate::EntityRegistry::spawn_or_recover).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The entity could not be recovered.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// A live process of another entity type already owns this id.
    #[error("entity {entity_id} is already running as a different type than {requested}")]
    TypeMismatch {
        /// The contested id.
        entity_id: EntityId,
        /// Entity type the caller asked for.
        requested: &'static str,
    },
}

/// Error returned when submitting a command to an entity.
///
/// Generic over `E`, the entity's business-rule error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError<E: std::error::Error + Send + Sync + 'static> {
    /// The command handler declined the command. Nothing was persisted.
    #[error(transparent)]
    ValidationRejected(E),

    /// The journal append failed. State is unchanged; the engine does not
    /// retry.
    #[error("persistence failure: {0}")]
    PersistenceFailure(JournalError),

    /// Another writer advanced the entity's journal. The entity process has
    /// stopped and must be recovered again before accepting commands.
    #[error("concurrent writer detected: expected last sequence {expected}, found {actual}")]
    Conflict {
        /// Sequence number the process believed was last.
        expected: SequenceNumber,
        /// Sequence number found in the journal.
        actual: SequenceNumber,
    },

    /// The mailbox is full.
    #[error("entity mailbox is full")]
    Overloaded,

    /// The entity process is stopping or has stopped.
    #[error("entity process is stopped")]
    Stopped,
}

impl<E: std::error::Error + Send + Sync + 'static> EngineError<E> {
    /// Returns `true` for [`EngineError::ValidationRejected`].
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::ValidationRejected(_))
    }

    /// Map a journal append failure onto the submitter-facing error.
    pub(crate) fn from_append(err: JournalError) -> Self {
        match err {
            JournalError::Conflict {
                expected, actual, ..
            } => Self::Conflict { expected, actual },
            other => Self::PersistenceFailure(other),
        }
    }
}
