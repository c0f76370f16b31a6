//! Per-task sync snapshot
//!
//! The snapshot is the third leg of the three-way diff: the state of the
//! tree as of the last successful run. It is rebuilt by re-enumeration after
//! a run completes and never updated on failure, so a failed run is retried
//! against the same baseline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Last-known-good state of one file, keyed by its path relative to the
/// task's roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_token: Option<String>,
    /// Adler-32 over local content, present when the task uses checksum
    /// detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
}

/// Snapshot of one task's tree after its last successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub task_id: TaskId,
    pub captured_at: DateTime<Utc>,
    /// Relative path (`/`-separated) → entry. Directories are implied by
    /// their children and not stored.
    pub entries: BTreeMap<String, SnapshotEntry>,
}

impl SyncSnapshot {
    pub fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            captured_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, rel_path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(rel_path)
    }
}
