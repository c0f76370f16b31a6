//! Tree enumeration for the three-way diff
//!
//! Both sides enumerate depth-first into relative-path maps. Directories are
//! always walked, even when they fail the include filter, so their children
//! can still be considered. Checksums (Adler-32) are computed only when the
//! task's detection mode needs them: locally by reading the file, remotely
//! from per-entry metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adler2::Adler32;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tracing::debug;

use drivemesh_core::domain::{EngineError, EngineResult, Tenant};
use drivemesh_core::ports::DriveBackend;

use crate::filter::GlobFilter;

/// One remote file, keyed by its path relative to the task's remote folder.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub token: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub checksum: Option<u32>,
}

/// One local file, keyed by its path relative to the task's local root.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub checksum: Option<u32>,
}

/// Depth-first enumeration of the remote folder.
///
/// A listing holding two live entries with one name is surfaced as
/// `PersistenceCorrupt` rather than silently picking one.
pub async fn enumerate_remote(
    backend: &dyn DriveBackend,
    tenant: &Tenant,
    root_token: &str,
    filter: &GlobFilter,
    want_checksums: bool,
) -> EngineResult<BTreeMap<String, RemoteFile>> {
    let mut files = BTreeMap::new();
    let mut stack: Vec<(String, String)> = vec![(root_token.to_string(), String::new())];

    while let Some((token, prefix)) = stack.pop() {
        let entries = backend.list_folder(tenant, &token).await?;

        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(EngineError::PersistenceCorrupt(format!(
                    "remote folder '{prefix}' holds two entries named '{}'",
                    entry.name
                )));
            }
        }

        for entry in entries {
            let rel = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.kind.is_folder() {
                // Directories are walked regardless of the include filter.
                stack.push((entry.token, rel));
            } else if filter.matches(&rel) {
                let (size, mtime, checksum) = if want_checksums {
                    let meta = backend.metadata(tenant, &entry.token).await?;
                    (meta.size, meta.mtime, meta.checksum)
                } else {
                    (
                        entry.size.unwrap_or(0),
                        entry.mtime.unwrap_or_else(Utc::now),
                        None,
                    )
                };
                files.insert(
                    rel,
                    RemoteFile {
                        token: entry.token,
                        size,
                        mtime,
                        checksum,
                    },
                );
            }
        }
    }

    debug!(files = files.len(), "Remote enumeration complete");
    Ok(files)
}

/// Depth-first walk of the local directory.
pub async fn enumerate_local(
    root: &Path,
    filter: &GlobFilter,
    want_checksums: bool,
) -> EngineResult<BTreeMap<String, LocalFile>> {
    let mut files = BTreeMap::new();
    if tokio::fs::metadata(root).await.is_err() {
        // A missing local root enumerates as empty rather than failing; the
        // runner creates it before executing downloads.
        return Ok(files);
    }

    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .map_err(|_| EngineError::LocalIo(format!("{} escaped the walk", path.display())))?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let meta = entry.metadata().await?;

            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() && filter.matches(&rel) {
                let mtime: DateTime<Utc> = meta
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                let checksum = if want_checksums {
                    Some(adler32_of_file(&path).await?)
                } else {
                    None
                };
                files.insert(
                    rel,
                    LocalFile {
                        path,
                        size: meta.len(),
                        mtime,
                        checksum,
                    },
                );
            }
        }
    }

    debug!(files = files.len(), "Local enumeration complete");
    Ok(files)
}

/// Adler-32 over a file's content, streamed in 64 KiB chunks.
pub async fn adler32_of_file(path: &Path) -> EngineResult<u32> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Adler32::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.write_slice(&buf[..n]);
    }
    Ok(hasher.checksum())
}
