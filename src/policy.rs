//! Snapshot scheduling and retention.

use serde::{Deserialize, Serialize};

use crate::entity::SequenceNumber;

/// When to take snapshots and how many to keep.
///
/// # Examples
///
/// ```
/// use eventfold_engine::SnapshotPolicy;
///
/// let policy = SnapshotPolicy::every(20).keep(3);
/// assert_eq!(policy.every_n_events, 20);
/// assert_eq!(policy.retained(), 3);
/// assert!(!SnapshotPolicy::disabled().is_enabled());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    /// Take a snapshot once this many events have been persisted since the
    /// last one. `0` disables snapshots.
    ///
    /// Default: 100.
    pub every_n_events: u64,

    /// Number of most recent snapshots kept per entity. Values below 1 are
    /// treated as 1.
    ///
    /// Default: 2.
    pub keep_n_snapshots: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_n_events: 100,
            keep_n_snapshots: 2,
        }
    }
}

impl SnapshotPolicy {
    /// Snapshot every `n` events, keeping the default number of snapshots.
    pub fn every(n: u64) -> Self {
        Self {
            every_n_events: n,
            ..Self::default()
        }
    }

    /// Never snapshot.
    pub fn disabled() -> Self {
        Self::every(0)
    }

    /// Set how many snapshots to retain.
    pub fn keep(mut self, n: usize) -> Self {
        self.keep_n_snapshots = n;
        self
    }

    /// Returns `true` unless `every_n_events` is zero.
    pub fn is_enabled(&self) -> bool {
        self.every_n_events > 0
    }

    /// Effective retention count (at least 1).
    pub fn retained(&self) -> usize {
        self.keep_n_snapshots.max(1)
    }

    /// Sequence below which snapshots may be deleted.
    ///
    /// `sequences` lists the stored snapshot sequences in ascending order.
    /// Returns `None` when no more than [`retained`](Self::retained) exist.
    pub fn retention_cutoff(&self, sequences: &[SequenceNumber]) -> Option<SequenceNumber> {
        let keep = self.retained();
        if sequences.len() <= keep {
            return None;
        }
        sequences.get(sequences.len() - keep).copied()
    }
}

/// In-memory count of events persisted since the last snapshot request.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotTracker {
    policy: SnapshotPolicy,
    since_last: u64,
}

impl SnapshotTracker {
    /// Start counting from `already_pending` events (those replayed on top of
    /// the latest snapshot during recovery).
    pub(crate) fn new(policy: SnapshotPolicy, already_pending: u64) -> Self {
        Self {
            policy,
            since_last: already_pending,
        }
    }

    /// Record a persisted batch of `count` events.
    ///
    /// Returns `true` when a snapshot should be requested; the counter is
    /// reset in that case.
    pub(crate) fn record(&mut self, count: u64) -> bool {
        if !self.policy.is_enabled() {
            return false;
        }
        self.since_last = self.since_last.saturating_add(count);
        if self.since_last >= self.policy.every_n_events {
            self.since_last = 0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> u64 {
        self.since_last
    }
}
