//! Event-sourced entities run as single-writer async processes.
//!
//! Each [`Entity`] lives in its own tokio task. Commands are decided against
//! the current state, the resulting events are appended to a [`Journal`],
//! folded into the state, and only then is the caller answered. On start an
//! entity is rebuilt from its latest snapshot plus the trailing journal
//! events; a [`SnapshotPolicy`] bounds how many events that replay covers.

mod actor;
pub use actor::{EntityHandle, spawn_entity};
mod command;
mod config;
mod entity;
pub use entity::{Effect, Entity, EntityId, InvalidEntityId, ReplyFn, SequenceNumber, fold};
mod error;
mod event;
mod journal;
mod policy;
mod recovery;
mod registry;
mod snapshot;
mod storage;

pub use command::CommandContext;
pub use config::EntityConfig;
pub use error::{EngineError, JournalError, RecoveryError, RegistryError, SnapshotError};
pub use event::{
    JournalRecord, NewEvent, UNTAGGED_EVENT_TYPE, decode_event, encode_event, encode_events,
};
pub use journal::{EventStream, InMemoryJournal, Journal};
pub use policy::SnapshotPolicy;
pub use recovery::{Recovered, recover};
pub use registry::{EntityRegistry, EntityRegistryBuilder};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotRecord, SnapshotStore};
pub use storage::{FileJournal, StorageLayout};
