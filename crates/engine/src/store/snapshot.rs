// Capped history of named point-in-time copies of the global state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::GlobalState;

pub const DEFAULT_SNAPSHOT_CAP: usize = 50;

/// Monotonic snapshot identifier, unique within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// An immutable full copy of the state at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub metadata: SnapshotMetadata,
    pub state: GlobalState,
}

/// Ordered snapshot history with oldest-first eviction beyond the cap.
#[derive(Debug)]
pub struct SnapshotManager {
    history: VecDeque<Snapshot>,
    cap: usize,
    next_id: u64,
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::with_cap(DEFAULT_SNAPSHOT_CAP)
    }
}

impl SnapshotManager {
    pub fn with_cap(cap: usize) -> Self {
        Self { history: VecDeque::new(), cap: cap.max(1), next_id: 0 }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.history.iter()
    }

    /// Deep-copy `state` into the history; evicts the oldest entry when
    /// the cap is exceeded. Returns the new snapshot.
    pub fn create(
        &mut self,
        state: &GlobalState,
        description: impl Into<String>,
        tags: Vec<String>,
        now: DateTime<Utc>,
    ) -> Snapshot {
        let snapshot = Snapshot {
            id: SnapshotId(self.next_id),
            metadata: SnapshotMetadata { description: description.into(), tags, created_at: now },
            state: state.clone(),
        };
        self.next_id += 1;
        self.history.push_back(snapshot.clone());
        while self.history.len() > self.cap {
            self.history.pop_front();
        }
        snapshot
    }

    /// Look up a snapshot for restore. A miss has no side effects.
    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.history.iter().find(|s| s.id == id)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Replace the whole history (state import).
    pub fn replace(&mut self, snapshots: Vec<Snapshot>) {
        self.next_id = snapshots.iter().map(|s| s.id.0 + 1).max().unwrap_or(0);
        self.history = snapshots.into();
        while self.history.len() > self.cap {
            self.history.pop_front();
        }
    }

    pub fn export(&self) -> Vec<Snapshot> {
        self.history.iter().cloned().collect()
    }
}
