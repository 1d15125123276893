//! Entity trait, command effects, and identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Position of an event within one entity's journal.
///
/// `0` means "no events yet"; the first persisted event is `1`.
pub type SequenceNumber = u64;

/// Reason an [`EntityId`] was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEntityId {
    /// The id was empty or contained only whitespace.
    #[error("entity id must not be empty")]
    Empty,

    /// The id contained a path separator or a `..` component.
    ///
    /// File-backed stores use the id as a file name, so these are rejected
    /// for every store.
    #[error("entity id {0:?} contains a path separator or '..'")]
    PathLike(String),
}

/// Opaque, non-empty identifier of a single entity.
///
/// Primary key for the journal and the snapshot store. Ids are expected to be
/// unique across entity types.
///
/// # Examples
///
/// ```
/// use eventfold_engine::EntityId;
///
/// let id = EntityId::new("account-42").unwrap();
/// assert_eq!(id.as_str(), "account-42");
/// assert!(EntityId::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Validate and wrap an entity id.
    ///
    /// # Errors
    ///
    /// * [`InvalidEntityId::Empty`] if `id` is empty or whitespace only.
    /// * [`InvalidEntityId::PathLike`] if `id` is `.` or contains `/`, `\`
    ///   or `..`.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidEntityId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InvalidEntityId::Empty);
        }
        if id == "." || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(InvalidEntityId::PathLike(id));
        }
        Ok(Self(id))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for EntityId {
    type Err = InvalidEntityId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = InvalidEntityId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for EntityId {
    type Error = InvalidEntityId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

// Deserialization goes through `new` so ids read back from disk obey the
// same rules as ids built in code.
impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Reply function carried by [`Effect::Persist`].
pub type ReplyFn<E> = Box<dyn FnOnce(&E) -> <E as Entity>::Reply + Send>;

/// Declarative outcome of handling one command.
///
/// Returned by [`Entity::handle`]; the entity process interprets it.
pub enum Effect<E: Entity> {
    /// Decline the command. Nothing is persisted and the caller receives
    /// [`EngineError::ValidationRejected`](crate::EngineError::ValidationRejected).
    Reject(E::Error),

    /// Answer without persisting anything.
    Reply(E::Reply),

    /// Persist `events` as one atomic batch, fold them into the state, then
    /// answer with `reply` evaluated against the post-fold state.
    Persist {
        /// Events to append, in order.
        events: Vec<E::Event>,
        /// Builds the reply from the state after all events are applied.
        reply: ReplyFn<E>,
    },
}

impl<E: Entity> Effect<E> {
    /// Shorthand for [`Effect::Reject`].
    pub fn reject(error: E::Error) -> Self {
        Self::Reject(error)
    }

    /// Shorthand for [`Effect::Reply`].
    pub fn reply(value: E::Reply) -> Self {
        Self::Reply(value)
    }

    /// Persist `events` and build the reply from the resulting state.
    ///
    /// Inside [`Entity::handle`] the closure's parameter type is not inferred
    /// from the return type, so annotate it (`|s: &Self| s.balance`) or name
    /// the entity (`Effect::<Self>::persist`).
    pub fn persist<F>(events: Vec<E::Event>, reply: F) -> Self
    where
        F: FnOnce(&E) -> E::Reply + Send + 'static,
    {
        Self::Persist {
            events,
            reply: Box::new(reply),
        }
    }

    /// Persist a single event and build the reply from the resulting state.
    pub fn persist_one<F>(event: E::Event, reply: F) -> Self
    where
        F: FnOnce(&E) -> E::Reply + Send + 'static,
    {
        Self::persist(vec![event], reply)
    }
}

impl<E: Entity> fmt::Debug for Effect<E>
where
    E::Error: fmt::Debug,
    E::Reply: fmt::Debug,
    E::Event: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(err) => f.debug_tuple("Reject").field(err).finish(),
            Self::Reply(value) => f.debug_tuple("Reply").field(value).finish(),
            Self::Persist { events, .. } => {
                f.debug_struct("Persist").field("events", events).finish()
            }
        }
    }
}

/// An entity whose state is derived from its event history.
///
/// The implementing type is the entity's state. The empty state is supplied
/// when the entity is spawned, so no `Default` bound is required.
///
/// # Contract
///
/// - [`handle`](Entity::handle) is the command handler: a deterministic
///   decision function with no I/O and no side effects. Only the events it
///   returns become durable.
/// - [`apply`](Entity::apply) is the event handler: a pure, total fold step.
///   Folding the same events from the same empty state always yields the
///   same state.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this entity type (e.g. `"account"`). Used in logs.
    const ENTITY_TYPE: &'static str;

    /// Commands this entity accepts.
    type Command: Send + 'static;

    /// Events this entity produces and folds.
    ///
    /// By convention these use adjacently tagged serde
    /// (`#[serde(tag = "type", content = "data")]`) so the journal can record
    /// the variant name as the event type.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Value returned to the caller on success.
    type Reply: Send + 'static;

    /// Business-rule rejection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide what a command does against the current state.
    fn handle(&self, cmd: Self::Command) -> Effect<Self>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;
}

/// Fold a sequence of events into `state`.
pub fn fold<'a, E, I>(state: E, events: I) -> E
where
    E: Entity,
    I: IntoIterator<Item = &'a E::Event>,
{
    events.into_iter().fold(state, |state, event| state.apply(event))
}
