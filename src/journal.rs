//! Journal contract and the in-memory backend.
//!
//! A journal is the append-only, per-entity event log that is the source of
//! truth for every entity. The engine only consumes it through the
//! [`Journal`] trait; [`InMemoryJournal`] and
//! [`FileJournal`](crate::FileJournal) are the built-in backends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_stream::Stream;

use crate::entity::{EntityId, SequenceNumber};
use crate::error::JournalError;
use crate::event::{JournalRecord, NewEvent};

/// Lazy, ordered, finite stream of journal records.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<JournalRecord, JournalError>> + Send>>;

/// Append-only durable event log keyed by (entity id, sequence number).
///
/// Implementations must isolate writes per entity: two concurrent appends
/// for the same entity with the same `expected_last_seq` must not both
/// succeed.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append `events` after `expected_last_seq`, all or nothing.
    ///
    /// The events receive sequence numbers `expected_last_seq + 1 ..=
    /// expected_last_seq + events.len()` and are durable when this returns.
    ///
    /// # Returns
    ///
    /// The entity's new last sequence number.
    ///
    /// # Errors
    ///
    /// * [`JournalError::Conflict`] if the stored last sequence differs from
    ///   `expected_last_seq`. Nothing is written.
    /// * Any other variant if the write failed. Nothing is written.
    async fn append(
        &self,
        entity_id: &EntityId,
        expected_last_seq: SequenceNumber,
        events: Vec<NewEvent>,
    ) -> Result<SequenceNumber, JournalError>;

    /// Read every event with a sequence number strictly greater than `after`.
    ///
    /// The stream is ordered by sequence number and ends once the entity's
    /// current events are exhausted. It can be re-opened from any offset.
    async fn read_from(
        &self,
        entity_id: &EntityId,
        after: SequenceNumber,
    ) -> Result<EventStream, JournalError>;

    /// Current last sequence number for the entity, `0` if it has no events.
    async fn last_sequence(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError>;
}

/// Journal that keeps every record in memory.
///
/// Useful for tests and for entities whose history does not need to survive
/// the process. `Clone` is cheap and clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    streams: Arc<RwLock<HashMap<EntityId, Vec<JournalRecord>>>>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of every record stored for `entity_id`.
    pub async fn records(&self, entity_id: &EntityId) -> Vec<JournalRecord> {
        self.streams
            .read()
            .await
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(
        &self,
        entity_id: &EntityId,
        expected_last_seq: SequenceNumber,
        events: Vec<NewEvent>,
    ) -> Result<SequenceNumber, JournalError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(entity_id.clone()).or_default();

        let actual = stream.last().map_or(0, |r| r.sequence);
        if actual != expected_last_seq {
            return Err(JournalError::Conflict {
                entity_id: entity_id.clone(),
                expected: expected_last_seq,
                actual,
            });
        }

        let now = Utc::now();
        let mut sequence = actual;
        for event in events {
            sequence += 1;
            stream.push(JournalRecord::new(entity_id.clone(), sequence, event, now));
        }
        Ok(sequence)
    }

    async fn read_from(
        &self,
        entity_id: &EntityId,
        after: SequenceNumber,
    ) -> Result<EventStream, JournalError> {
        let records: Vec<Result<JournalRecord, JournalError>> = self
            .streams
            .read()
            .await
            .get(entity_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.sequence > after)
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(records)))
    }

    async fn last_sequence(&self, entity_id: &EntityId) -> Result<SequenceNumber, JournalError> {
        Ok(self
            .streams
            .read()
            .await
            .get(entity_id)
            .and_then(|stream| stream.last())
            .map_or(0, |r| r.sequence))
    }
}
