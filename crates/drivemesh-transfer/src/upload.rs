//! Upload executors
//!
//! Single-file uploads follow the chunked protocol: init a session, stream
//! blocks in strict ascending sequence, persist the checkpoint after each
//! block, finish once. Pausing takes effect between blocks and resuming
//! restarts from the persisted `next_seq`. Folder uploads mirror the local
//! tree top-down and enqueue one child transfer per leaf file.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use drivemesh_core::domain::{
    EngineError, EngineResult, ResumePayload, Tenant, Transfer, TransferId, TransferKind,
};
use drivemesh_core::ports::DriveBackend;

use crate::engine::{monitor_children, submit_child, ControlHandle, EngineInner};
use crate::retry::with_backoff;

/// Runs one file upload to completion, pause, or failure.
pub(crate) async fn run_file(inner: &Arc<EngineInner>, id: &TransferId) -> EngineResult<()> {
    let control = inner.control(id);
    let transfer = inner.load(id).await?;
    let tenant = inner.tenant_for(&transfer).await?;

    let _direction_slot = inner
        .upload_slots
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

    // Fresh session, or the persisted checkpoint after pause/restart.
    let (upload_id, block_size, mut next_seq, file_path, size) = match &transfer.resume_payload {
        Some(ResumePayload::Upload {
            upload_id,
            block_size,
            next_seq,
            file_path,
            size,
            ..
        }) => (
            upload_id.clone(),
            *block_size,
            *next_seq,
            file_path.clone(),
            *size,
        ),
        _ => init_session(inner, id, &tenant, &transfer).await?,
    };

    let mut file = tokio::fs::File::open(&file_path).await?;
    let total_blocks = if size == 0 {
        0
    } else {
        size.div_ceil(block_size)
    };

    while next_seq < total_blocks {
        if control.cancel.is_cancelled() {
            abort_session(inner, &tenant, &upload_id).await;
            return Err(EngineError::Cancelled);
        }
        if control.pause.load(Ordering::Acquire) {
            inner.mutate(id, |t| t.mark_paused()).await?;
            info!(transfer_id = %id, next_seq, "Upload paused between blocks");
            return Ok(());
        }

        let offset = next_seq * block_size;
        let len = block_size.min(size - offset);
        let mut buf = vec![0u8; len as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;

        let backend = inner.router.backend();
        with_backoff(inner.retry, "upload_block", || {
            backend.upload_block(&tenant, &upload_id, next_seq, buf.clone())
        })
        .await?;

        next_seq += 1;
        inner
            .mutate(id, |t| {
                t.record_progress(len);
                if let Some(ResumePayload::Upload { next_seq: seq, .. }) = &mut t.resume_payload {
                    *seq = next_seq;
                }
                Ok(())
            })
            .await?;
        debug!(transfer_id = %id, seq = next_seq - 1, len, "Block uploaded");
    }

    let backend = inner.router.backend();
    let token = with_backoff(inner.retry, "upload_finish", || {
        backend.upload_finish(&tenant, &upload_id)
    })
    .await?;

    inner
        .mutate(id, move |t| {
            t.resource_token = Some(token.clone());
            t.mark_success()
        })
        .await?;
    info!(transfer_id = %id, "Upload completed");
    Ok(())
}

/// Opens the upload session and persists the initial checkpoint.
async fn init_session(
    inner: &Arc<EngineInner>,
    id: &TransferId,
    tenant: &Tenant,
    transfer: &Transfer,
) -> EngineResult<(String, u64, u64, PathBuf, u64)> {
    let file_path = transfer
        .local_path
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("upload without a local path".into()))?;
    let parent_token = transfer
        .parent_token
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("upload without a parent folder".into()))?;
    let size = tokio::fs::metadata(&file_path).await?.len();
    let file_name = transfer.name.clone();

    let backend = inner.router.backend();
    let session = with_backoff(inner.retry, "upload_init", || {
        backend.upload_init(tenant, &parent_token, &file_name, size)
    })
    .await?;

    let payload = ResumePayload::Upload {
        upload_id: session.upload_id.clone(),
        block_size: session.block_size,
        next_seq: 0,
        parent_token,
        file_path: file_path.clone(),
        file_name,
        size,
    };
    inner
        .mutate(id, move |t| {
            t.size = size;
            t.resume_payload = Some(payload);
            Ok(())
        })
        .await?;

    Ok((session.upload_id, session.block_size, 0, file_path, size))
}

/// Best-effort session abort on cancel.
async fn abort_session(inner: &Arc<EngineInner>, tenant: &Tenant, upload_id: &str) {
    if let Err(err) = inner.router.backend().upload_abort(tenant, upload_id).await {
        debug!(upload_id, error = %err, "Upload abort failed (ignored)");
    }
}

// ============================================================================
// Folder uploads
// ============================================================================

/// Mirrors a local directory tree to the remote parent and fans out one
/// child transfer per file. The folder record's progress is the sum of its
/// children's; it succeeds only when every child does.
pub(crate) async fn run_folder(inner: &Arc<EngineInner>, id: &TransferId) -> EngineResult<()> {
    let control = inner.control(id);
    let transfer = inner.load(id).await?;
    let tenant = inner.tenant_for(&transfer).await?;
    let local_dir = transfer
        .local_path
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("folder upload without a local path".into()))?;
    let parent_token = transfer
        .parent_token
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("folder upload without a parent".into()))?;

    inner.mutate(id, |t| t.begin_running()).await?;

    let tree = walk_local_tree(&local_dir).await?;
    let total: u64 = tree.files.iter().map(|f| f.size).sum();
    inner
        .mutate(id, |t| {
            t.size = total;
            Ok(())
        })
        .await?;

    // Mirror directories top-down, reusing folders that already exist.
    let backend = inner.router.backend();
    let root_token =
        ensure_remote_folder(backend.as_ref(), &tenant, &parent_token, &transfer.name).await?;
    let mut folder_tokens: HashMap<String, String> = HashMap::new();
    folder_tokens.insert(String::new(), root_token);

    for dir_rel in &tree.dirs {
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let (parent_rel, name) = split_rel(dir_rel);
        let parent = folder_tokens
            .get(parent_rel)
            .cloned()
            .ok_or_else(|| EngineError::LocalIo(format!("missing parent folder for {dir_rel}")))?;
        let token = ensure_remote_folder(backend.as_ref(), &tenant, &parent, name).await?;
        folder_tokens.insert(dir_rel.clone(), token);
    }

    // One child transfer per leaf file.
    for file in &tree.files {
        let (dir_rel, name) = split_rel(&file.rel);
        let remote_parent = folder_tokens
            .get(dir_rel)
            .cloned()
            .ok_or_else(|| EngineError::LocalIo(format!("missing folder for {}", file.rel)))?;

        let mut child = Transfer::new(TransferKind::FileUp, name);
        child.tenant_id = Some(tenant.id.clone());
        child.parent_token = Some(remote_parent);
        child.local_path = Some(local_dir.join(&file.rel));
        child.size = file.size;
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

struct LocalFile {
    rel: String,
    size: u64,
}

struct LocalTree {
    /// Relative directory paths, parents before children.
    dirs: Vec<String>,
    files: Vec<LocalFile>,
}

/// Walks a directory tree, collecting relative paths with `/` separators.
async fn walk_local_tree(root: &Path) -> EngineResult<LocalTree> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .map_err(|_| EngineError::LocalIo(format!("{} escaped the tree", path.display())))?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                dirs.push(rel);
                pending.push(path);
            } else if meta.is_file() {
                files.push(LocalFile {
                    rel,
                    size: meta.len(),
                });
            }
        }
    }

    dirs.sort();
    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(LocalTree { dirs, files })
}

/// Splits a relative path into its parent directory and final component.
fn split_rel(rel: &str) -> (&str, &str) {
    match rel.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", rel),
    }
}

/// Returns the token of `name` under `parent`, creating the folder when it
/// does not exist yet.
async fn ensure_remote_folder(
    backend: &dyn DriveBackend,
    tenant: &Tenant,
    parent: &str,
    name: &str,
) -> EngineResult<String> {
    let entries = backend.list_folder(tenant, parent).await?;
    if let Some(existing) = entries
        .iter()
        .find(|e| e.name == name && e.kind.is_folder())
    {
        return Ok(existing.token.clone());
    }
    backend.create_folder(tenant, parent, name).await
}
