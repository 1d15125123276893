//! Event encoding and the persisted journal record.
//!
//! Domain events are turned into [`NewEvent`]s before being handed to a
//! [`Journal`](crate::Journal). The journal assigns sequence numbers and
//! timestamps and returns [`JournalRecord`]s when read back. No I/O happens
//! here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandContext;
use crate::entity::{Entity, EntityId, SequenceNumber};

/// Event type recorded for payloads that are not adjacently tagged enums.
pub const UNTAGGED_EVENT_TYPE: &str = "event";

/// An event ready to be appended, before the journal assigns its sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Freshly generated UUID v4, unique per event.
    pub event_id: Uuid,
    /// Variant name of the domain event, or [`UNTAGGED_EVENT_TYPE`].
    pub event_type: String,
    /// The full serialized domain event.
    pub payload: serde_json::Value,
    /// Context of the command that produced the event, if any was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CommandContext>,
}

/// A persisted event as stored in, and read back from, a journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Entity the event belongs to.
    pub entity_id: EntityId,
    /// Sequence number assigned at append time.
    pub sequence: SequenceNumber,
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Variant name of the domain event.
    pub event_type: String,
    /// The full serialized domain event.
    pub payload: serde_json::Value,
    /// Context of the originating command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CommandContext>,
    /// Wall-clock time at which the journal accepted the event.
    pub recorded_at: DateTime<Utc>,
}

impl JournalRecord {
    /// Stamp a [`NewEvent`] with its identity and position.
    pub fn new(
        entity_id: EntityId,
        sequence: SequenceNumber,
        event: NewEvent,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            sequence,
            event_id: event.event_id,
            event_type: event.event_type,
            payload: event.payload,
            metadata: event.metadata,
            recorded_at,
        }
    }
}

/// Encode a domain event for appending.
///
/// The whole serialized event is kept as the payload. When the event is an
/// adjacently tagged enum (`{"type": ..., "data": ...}`) the tag is copied
/// into `event_type` so stored records are readable without the Rust types.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized.
pub fn encode_event<E: Entity>(
    event: &E::Event,
    ctx: &CommandContext,
) -> serde_json::Result<NewEvent> {
    let payload = serde_json::to_value(event)?;
    let event_type = payload
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(UNTAGGED_EVENT_TYPE)
        .to_owned();

    Ok(NewEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata: (!ctx.is_empty()).then(|| ctx.clone()),
    })
}

/// Encode a batch of domain events, failing on the first error.
///
/// # Errors
///
/// Returns `serde_json::Error` if any event cannot be serialized.
pub fn encode_events<E: Entity>(
    events: &[E::Event],
    ctx: &CommandContext,
) -> serde_json::Result<Vec<NewEvent>> {
    events.iter().map(|e| encode_event::<E>(e, ctx)).collect()
}

/// Decode a stored record back into the entity's event type.
///
/// # Errors
///
/// Returns `serde_json::Error` if the payload does not match `E::Event`.
pub fn decode_event<E: Entity>(record: &JournalRecord) -> serde_json::Result<E::Event> {
    <E::Event as Deserialize>::deserialize(&record.payload)
}
