//! Snapshot records, the snapshot store contract, and built-in backends.
//!
//! File snapshots are stored as JSON files at
//! `<base_dir>/snapshots/<entity_id>/<sequence>.json`. Writes are atomic via a
//! temp-rename pattern so a crash mid-write never leaves a torn snapshot.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::entity::{Entity, EntityId, SequenceNumber};
use crate::error::SnapshotError;
use crate::storage::StorageLayout;

/// A point-in-time checkpoint of an entity's state.
///
/// Replaying every event with a sequence number greater than `sequence`,
/// starting from `state`, reproduces the entity's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Entity the snapshot belongs to.
    pub entity_id: EntityId,
    /// Number of events folded into `state`.
    pub sequence: SequenceNumber,
    /// Serialized entity state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Serialize `state` into a snapshot taken now.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state cannot be serialized.
    pub fn capture<E: Entity>(
        entity_id: EntityId,
        sequence: SequenceNumber,
        state: &E,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            entity_id,
            sequence,
            state: serde_json::to_value(state)?,
            created_at: Utc::now(),
        })
    }

    /// Deserialize the stored state as `E`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state does not match `E`.
    pub fn decode_state<E: Entity>(&self) -> serde_json::Result<E> {
        <E as Deserialize>::deserialize(&self.state)
    }
}

/// Durable store of snapshots keyed by entity id.
///
/// Save and prune failures are logged by the engine and never fail a
/// command. A failing `load_latest` fails recovery.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot. Saving the same sequence twice replaces it.
    async fn save(&self, snapshot: SnapshotRecord) -> Result<(), SnapshotError>;

    /// Return the snapshot with the highest sequence number, if any.
    async fn load_latest(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, SnapshotError>;

    /// Sequence numbers of every stored snapshot, ascending.
    async fn list(&self, entity_id: &EntityId) -> Result<Vec<SequenceNumber>, SnapshotError>;

    /// Delete every snapshot whose sequence number is strictly below
    /// `sequence`.
    ///
    /// # Returns
    ///
    /// The number of snapshots removed.
    async fn delete_older_than(
        &self,
        entity_id: &EntityId,
        sequence: SequenceNumber,
    ) -> Result<usize, SnapshotError>;
}

/// Snapshot store that keeps snapshots in memory.
///
/// `Clone` is cheap and clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<EntityId, BTreeMap<SequenceNumber, SnapshotRecord>>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: SnapshotRecord) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .await
            .entry(snapshot.entity_id.clone())
            .or_default()
            .insert(snapshot.sequence, snapshot);
        Ok(())
    }

    async fn load_latest(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(entity_id)
            .and_then(|by_seq| by_seq.values().next_back())
            .cloned())
    }

    async fn list(&self, entity_id: &EntityId) -> Result<Vec<SequenceNumber>, SnapshotError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(entity_id)
            .map(|by_seq| by_seq.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete_older_than(
        &self,
        entity_id: &EntityId,
        sequence: SequenceNumber,
    ) -> Result<usize, SnapshotError> {
        let mut snapshots = self.snapshots.write().await;
        let Some(by_seq) = snapshots.get_mut(entity_id) else {
            return Ok(0);
        };
        let kept = by_seq.split_off(&sequence);
        let removed = by_seq.len();
        *by_seq = kept;
        Ok(removed)
    }
}

/// Snapshot store writing one JSON file per snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StorageLayout,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir` (see [`StorageLayout`]).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StorageLayout::new(base_dir))
    }

    /// Create a store using an existing layout.
    pub fn with_layout(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Returns the layout this store writes to.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: SnapshotRecord) -> Result<(), SnapshotError> {
        let dir = self.layout.snapshot_dir(&snapshot.entity_id);
        fs::create_dir_all(&dir).await?;

        let path = self
            .layout
            .snapshot_path(&snapshot.entity_id, snapshot.sequence);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(&tmp_path, &json).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load_latest(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<SnapshotRecord>, SnapshotError> {
        // Newest first; an unreadable file is skipped in favour of the next
        // older one.
        for sequence in self.list(entity_id).await?.into_iter().rev() {
            let path = self.layout.snapshot_path(entity_id, sequence);
            let bytes = match fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<SnapshotRecord>(&bytes) {
                Ok(snap) => return Ok(Some(snap)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to deserialize snapshot; trying an older one"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn list(&self, entity_id: &EntityId) -> Result<Vec<SequenceNumber>, SnapshotError> {
        let mut entries = match fs::read_dir(self.layout.snapshot_dir(entity_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sequences = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<SequenceNumber>().ok())
            {
                sequences.push(seq);
            }
        }

        sequences.sort_unstable();
        Ok(sequences)
    }

    async fn delete_older_than(
        &self,
        entity_id: &EntityId,
        sequence: SequenceNumber,
    ) -> Result<usize, SnapshotError> {
        let mut removed = 0;
        for old in self.list(entity_id).await? {
            if old >= sequence {
                break;
            }
            match fs::remove_file(self.layout.snapshot_path(entity_id, old)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
