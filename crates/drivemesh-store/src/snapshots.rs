//! Per-task snapshot files
//!
//! Snapshots live beside the main documents as `snapshots/<task_id>.json`,
//! one file per task, written atomically like every other document. A lock
//! per store instance serializes writers; snapshots for different tasks never
//! contend in practice because a task runs at most once at a time.

use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use drivemesh_core::domain::{EngineError, EngineResult, SyncSnapshot, TaskId};

/// Storage for per-task [`SyncSnapshot`] documents.
pub struct SnapshotStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// Loads the snapshot for a task; `None` when the task has never
    /// completed a run.
    pub async fn load(&self, task_id: &TaskId) -> EngineResult<Option<SyncSnapshot>> {
        let path = self.path_for(task_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::PersistenceCorrupt(format!("{}: {e}", path.display()))
                })?;
                Ok(Some(snapshot))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replaces the snapshot for its task.
    pub async fn save(&self, snapshot: &SyncSnapshot) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&snapshot.task_id);
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| EngineError::LocalIo(format!("serialize snapshot: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(task_id = %snapshot.task_id, entries = snapshot.entries.len(), "Snapshot saved");
        Ok(())
    }

    /// Removes a task's snapshot, e.g. when the task is deleted.
    pub async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drivemesh_core::domain::SnapshotEntry;

    fn snapshot(task: &str) -> SyncSnapshot {
        let mut s = SyncSnapshot::empty(TaskId::from_string(task));
        s.entries.insert(
            "a.txt".into(),
            SnapshotEntry {
                size: 3,
                mtime: Utc::now(),
                remote_token: Some("tok_a".into()),
                checksum: None,
            },
        );
        s
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let loaded = store.load(&TaskId::from_string("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let snap = snapshot("task-1");
        store.save(&snap).await.unwrap();

        let loaded = store
            .load(&TaskId::from_string("task-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, snap);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let snap = snapshot("task-2");
        store.save(&snap).await.unwrap();
        store.delete(&snap.task_id).await.unwrap();
        store.delete(&snap.task_id).await.unwrap();
        assert!(store.load(&snap.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_surfaces_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let snapdir = dir.path().join("snapshots");
        tokio::fs::create_dir_all(&snapdir).await.unwrap();
        tokio::fs::write(snapdir.join("task-3.json"), b"oops")
            .await
            .unwrap();

        let store = SnapshotStore::new(&snapdir);
        let err = store.load(&TaskId::from_string("task-3")).await.unwrap_err();
        assert_eq!(err.kind(), "PersistenceCorrupt");
    }
}
