//! Per-entity process configuration.

use serde::{Deserialize, Serialize};

use crate::policy::SnapshotPolicy;

/// Configuration for one entity process.
///
/// All fields have defaults via [`EntityConfig::default()`]. The struct also
/// deserializes with missing fields filled from the defaults, so it can be
/// embedded in an application's own config file.
///
/// # Examples
///
/// ```
/// use eventfold_engine::{EntityConfig, SnapshotPolicy};
///
/// let config = EntityConfig::default()
///     .mailbox_capacity(8)
///     .snapshot_policy(SnapshotPolicy::every(20).keep(3));
/// assert_eq!(config.mailbox_capacity, 8);
/// assert_eq!(config.snapshot.every_n_events, 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Maximum number of queued commands. Submissions beyond this are
    /// rejected with [`EngineError::Overloaded`](crate::EngineError::Overloaded).
    ///
    /// Default: 64.
    pub mailbox_capacity: usize,

    /// Maximum number of snapshot requests waiting for the snapshot worker.
    /// Requests beyond this are dropped and retried at the next threshold.
    ///
    /// Default: 4.
    pub snapshot_queue_capacity: usize,

    /// Snapshot schedule and retention.
    pub snapshot: SnapshotPolicy,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            snapshot_queue_capacity: 4,
            snapshot: SnapshotPolicy::default(),
        }
    }
}

impl EntityConfig {
    /// Set the mailbox capacity (minimum 1).
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set the snapshot request queue capacity (minimum 1).
    pub fn snapshot_queue_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_queue_capacity = capacity;
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot = policy;
        self
    }

    // tokio panics on zero-capacity channels.
    pub(crate) fn effective_mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.max(1)
    }

    pub(crate) fn effective_snapshot_queue_capacity(&self) -> usize {
        self.snapshot_queue_capacity.max(1)
    }
}
