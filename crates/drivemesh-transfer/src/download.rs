//! Download executors
//!
//! Single-file downloads stream ranges into a `<final>.part` temp file and
//! atomically rename it once complete. The persisted checkpoint is the byte
//! count already on disk, so pause, crash, and resume all continue from the
//! temp file's length. Destination names that collide get ` (n)` suffixes.
//! Folder downloads mirror the remote tree depth-first, creating local
//! directories eagerly.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use drivemesh_core::domain::{
    EngineError, EngineResult, ResumePayload, Transfer, TransferId, TransferKind,
};

use crate::engine::{monitor_children, submit_child, EngineInner};
use crate::retry::with_backoff;

/// Bytes requested per ranged read.
const DOWNLOAD_CHUNK: u64 = 1024 * 1024;

/// Runs one file download to completion, pause, or failure.
pub(crate) async fn run_file(inner: &Arc<EngineInner>, id: &TransferId) -> EngineResult<()> {
    let control = inner.control(id);
    let transfer = inner.load(id).await?;
    let tenant = inner.tenant_for(&transfer).await?;

    let _direction_slot = inner
        .download_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Cancelled)?;
    let _tenant_slot = inner
        .tenant_slot(&tenant.id)
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Cancelled)?;

    if control.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if control.pause.load(Ordering::Acquire) {
        inner.mutate(id, |t| t.mark_paused()).await?;
        return Ok(());
    }

    let transfer = inner.mutate(id, |t| t.begin_running()).await?;

    let (temp_path, target_path, mut downloaded, token, size) = match &transfer.resume_payload {
        Some(ResumePayload::Download {
            temp_path,
            target_path,
            downloaded,
            token,
            ..
        }) => (
            temp_path.clone(),
            target_path.clone(),
            *downloaded,
            token.clone(),
            transfer.size,
        ),
        _ => init_download(inner, id, &transfer, &tenant).await?,
    };

    let mut temp = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&temp_path)
        .await?;

    loop {
        if size > 0 && downloaded >= size {
            break;
        }
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if control.pause.load(Ordering::Acquire) {
            temp.flush().await?;
            inner.mutate(id, |t| t.mark_paused()).await?;
            info!(transfer_id = %id, downloaded, "Download paused between blocks");
            return Ok(());
        }

        let backend = inner.router.backend();
        let chunk = with_backoff(inner.retry, "download_range", || {
            backend.download_range(&tenant, &token, downloaded, DOWNLOAD_CHUNK)
        })
        .await?;

        if chunk.is_empty() {
            if size > 0 && downloaded < size {
                return Err(EngineError::UpstreamPermanent(format!(
                    "remote file ended at {downloaded} of {size} bytes"
                )));
            }
            break;
        }

        temp.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        inner
            .mutate(id, |t| {
                t.transferred = downloaded;
                if let Some(ResumePayload::Download { downloaded: d, .. }) = &mut t.resume_payload {
                    *d = downloaded;
                }
                Ok(())
            })
            .await?;
        debug!(transfer_id = %id, downloaded, "Chunk written");
    }

    temp.flush().await?;
    temp.sync_all().await?;
    drop(temp);
    tokio::fs::rename(&temp_path, &target_path).await?;

    inner.mutate(id, |t| t.mark_success()).await?;
    info!(transfer_id = %id, target = %target_path.display(), "Download completed");
    Ok(())
}

/// Resolves the destination, opens the temp file, and persists the initial
/// checkpoint. An existing temp file's length is adopted as progress.
async fn init_download(
    inner: &Arc<EngineInner>,
    id: &TransferId,
    transfer: &Transfer,
    tenant: &drivemesh_core::domain::Tenant,
) -> EngineResult<(PathBuf, PathBuf, u64, String, u64)> {
    let token = transfer
        .resource_token
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("download without a remote token".into()))?;
    let dest_dir = transfer
        .local_path
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("download without a destination".into()))?;

    let backend = inner.router.backend();
    let meta = with_backoff(inner.retry, "metadata", || {
        backend.metadata(tenant, &token)
    })
    .await?;
    let size = meta.size;

    tokio::fs::create_dir_all(&dest_dir).await?;
    let target_path = unique_destination(&dest_dir, &transfer.name).await;
    let temp_path = part_path(&target_path);

    let downloaded = match tokio::fs::metadata(&temp_path).await {
        Ok(m) => m.len(),
        Err(_) => 0,
    };

    let payload = ResumePayload::Download {
        temp_path: temp_path.clone(),
        target_path: target_path.clone(),
        downloaded,
        token: token.clone(),
        file_name: transfer.name.clone(),
    };
    inner
        .mutate(id, {
            let target_path = target_path.clone();
            move |t| {
                t.size = size;
                t.transferred = downloaded;
                t.local_path = Some(target_path);
                t.resume_payload = Some(payload);
                Ok(())
            }
        })
        .await?;

    Ok((temp_path, target_path, downloaded, token, size))
}

/// `<final>.part` beside the target.
fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".part");
    target.with_file_name(name)
}

/// First free destination name: `name`, then `stem (1).ext`, `stem (2).ext`…
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };
    for n in 1u32.. {
        let next = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(next);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("u32 exhausted while deduplicating a file name")
}

// ============================================================================
// Folder downloads
// ============================================================================

/// Mirrors the remote folder under `dest_dir/<name>` and fans out one child
/// transfer per file, creating local directories eagerly.
pub(crate) async fn run_folder(inner: &Arc<EngineInner>, id: &TransferId) -> EngineResult<()> {
    let control = inner.control(id);
    let transfer = inner.load(id).await?;
    let tenant = inner.tenant_for(&transfer).await?;
    let folder_token = transfer
        .resource_token
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("folder download without a token".into()))?;
    let dest_dir = transfer
        .local_path
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("folder download without a destination".into()))?;

    inner.mutate(id, |t| t.begin_running()).await?;

    let root = dest_dir.join(&transfer.name);
    tokio::fs::create_dir_all(&root).await?;

    // Depth-first mirror: local directories first, then one child per file.
    let backend = inner.router.backend();
    let mut stack: Vec<(String, PathBuf)> = vec![(folder_token, root)];
    let mut files: Vec<(String, String, PathBuf, u64)> = Vec::new();

    while let Some((token, local_dir)) = stack.pop() {
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entries = with_backoff(inner.retry, "list_folder", || {
            backend.list_folder(&tenant, &token)
        })
        .await?;
        for entry in entries {
            if entry.kind.is_folder() {
                let sub = local_dir.join(&entry.name);
                tokio::fs::create_dir_all(&sub).await?;
                stack.push((entry.token, sub));
            } else {
                files.push((
                    entry.token,
                    entry.name,
                    local_dir.clone(),
                    entry.size.unwrap_or(0),
                ));
            }
        }
    }

    let total: u64 = files.iter().map(|(_, _, _, size)| size).sum();
    inner
        .mutate(id, |t| {
            t.size = total;
            Ok(())
        })
        .await?;

    for (token, name, dir, size) in files {
        let mut child = Transfer::new(TransferKind::FileDown, name);
        child.tenant_id = Some(tenant.id.clone());
        child.resource_token = Some(token);
        child.local_path = Some(dir);
        child.size = size;
        child.parent_id = Some(id.clone());
        child.task_id = transfer.task_id.clone();
        submit_child(inner, child).await?;
    }

    let (succeeded, failed) = monitor_children(inner, id, &control).await?;
    inner
        .mutate(id, move |t| {
            if failed == 0 {
                t.mark_success()
            } else {
                t.mark_failed(format!("{failed} of {} files failed", succeeded + failed))
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unique_destination_appends_counter_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("report.pdf"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("report (1).pdf"), b"x")
            .await
            .unwrap();

        let dest = unique_destination(dir.path(), "report.pdf").await;
        assert_eq!(dest, dir.path().join("report (2).pdf"));
    }

    #[tokio::test]
    async fn unique_destination_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("README"), b"x").await.unwrap();

        let dest = unique_destination(dir.path(), "README").await;
        assert_eq!(dest, dir.path().join("README (1)"));
    }

    #[tokio::test]
    async fn fresh_name_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let dest = unique_destination(dir.path(), "new.txt").await;
        assert_eq!(dest, dir.path().join("new.txt"));
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/dl/report.pdf")),
            PathBuf::from("/dl/report.pdf.part")
        );
    }
}
