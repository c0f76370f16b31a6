//! Single-file JSON document with a writer lock and atomic persistence

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use drivemesh_core::domain::{EngineError, EngineResult};

enum DocState<T> {
    Healthy(T),
    /// The on-disk file failed to parse. All access is refused until the
    /// operator repairs or removes the file and the process restarts.
    Corrupt(String),
}

/// One JSON document on disk.
///
/// Reads take the lock shared; mutations take it exclusive, run the caller's
/// closure against the in-memory value, and persist via
/// write-to-temp-then-rename before releasing. A mutation closure that
/// returns `Err` leaves both the in-memory value and the file untouched.
pub struct Document<T> {
    path: PathBuf,
    state: RwLock<DocState<T>>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync,
{
    /// Opens (or initializes) the document at `path`.
    ///
    /// A missing file yields `T::default()` without touching the disk; the
    /// first mutation creates it. A present-but-unparseable file marks the
    /// document corrupt.
    pub async fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => DocState::Healthy(value),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Document failed to parse, refusing access");
                    DocState::Corrupt(format!("{}: {}", path.display(), err))
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                DocState::Healthy(T::default())
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document under the shared lock.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> EngineResult<R> {
        let guard = self.state.read().await;
        match &*guard {
            DocState::Healthy(value) => Ok(f(value)),
            DocState::Corrupt(reason) => Err(EngineError::PersistenceCorrupt(reason.clone())),
        }
    }

    /// Mutates the document under the exclusive lock and persists the result.
    ///
    /// The closure's `Err` aborts the mutation: nothing is persisted and the
    /// in-memory value is restored.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> EngineResult<R>) -> EngineResult<R> {
        let mut guard = self.state.write().await;
        let value = match &mut *guard {
            DocState::Healthy(value) => value,
            DocState::Corrupt(reason) => {
                return Err(EngineError::PersistenceCorrupt(reason.clone()))
            }
        };

        let before = value.clone();
        match f(value) {
            Ok(result) => {
                if let Err(err) = persist(&self.path, value).await {
                    *value = before;
                    return Err(err);
                }
                Ok(result)
            }
            Err(err) => {
                *value = before;
                Err(err)
            }
        }
    }
}

/// Serializes `value` and atomically replaces `path` with it.
async fn persist<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| EngineError::LocalIo(format!("serialize {}: {e}", path.display())))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "Document persisted");
    Ok(())
}
