//! Transfer engine: durable queue and worker coordination
//!
//! Submitting a transfer persists its record, publishes the first event, and
//! spawns a worker. File workers are bounded by a per-direction pool and a
//! per-tenant cap; folder workers are pure orchestration and take no pool
//! slot (their children do). On startup every record left `running` or
//! `pending` by the previous process is demoted to `paused` for an explicit
//! user resume.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use drivemesh_core::config::TransferConfig;
use drivemesh_core::domain::{
    EngineError, EngineResult, GroupId, TaskId, Tenant, TenantId, Transfer, TransferId,
    TransferKind, TransferStatus,
};
use drivemesh_router::DriveRouter;
use drivemesh_store::Document;

use crate::events::{EventBus, SpeedTracker, TransferEvent};
use crate::retry::RetryPolicy;
use crate::{download, upload};

/// Per-transfer control signals shared between the engine and its worker.
#[derive(Clone)]
pub(crate) struct ControlHandle {
    /// Checked between blocks; the worker parks the transfer as paused.
    pub pause: Arc<AtomicBool>,
    /// Cancelling wins over pausing and fails the transfer.
    pub cancel: CancellationToken,
}

impl ControlHandle {
    fn new() -> Self {
        Self {
            pause: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }
}

pub(crate) struct EngineInner {
    pub transfers: Arc<Document<Vec<Transfer>>>,
    pub router: Arc<DriveRouter>,
    pub bus: EventBus,
    pub speed: SpeedTracker,
    pub controls: DashMap<TransferId, ControlHandle>,
    pub upload_slots: Arc<Semaphore>,
    pub download_slots: Arc<Semaphore>,
    tenant_slots: DashMap<TenantId, Arc<Semaphore>>,
    per_tenant_parallelism: usize,
    pub retry: RetryPolicy,
    pub tracker: TaskTracker,
}

impl EngineInner {
    pub async fn load(&self, id: &TransferId) -> EngineResult<Transfer> {
        let id_for_err = id.clone();
        let id = id.clone();
        self.transfers
            .read(move |all| all.iter().find(|t| t.id == id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("transfer {id_for_err}")))
    }

    /// Mutates one record, persists the document, and publishes the update.
    pub async fn mutate(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut Transfer) -> EngineResult<()>,
    ) -> EngineResult<Transfer> {
        let target = id.clone();
        let updated = self
            .transfers
            .update(move |all| {
                let t = all
                    .iter_mut()
                    .find(|t| t.id == target)
                    .ok_or_else(|| EngineError::NotFound(format!("transfer {target}")))?;
                f(t)?;
                Ok(t.clone())
            })
            .await?;

        let speed_bps = if updated.status.is_terminal() {
            self.speed.forget(id);
            0
        } else {
            self.speed.observe(id, updated.transferred)
        };
        self.bus
            .publish(TransferEvent {
                transfer: updated.clone(),
                speed_bps,
            })
            .await;
        Ok(updated)
    }

    pub fn control(&self, id: &TransferId) -> ControlHandle {
        self.controls
            .entry(id.clone())
            .or_insert_with(ControlHandle::new)
            .clone()
    }

    pub async fn tenant_for(&self, transfer: &Transfer) -> EngineResult<Tenant> {
        let tenant_id = transfer
            .tenant_id
            .as_ref()
            .ok_or_else(|| EngineError::InvalidArgument("transfer has no tenant".into()))?;
        self.router.registry().get_tenant(tenant_id).await
    }

    /// The per-tenant concurrency gate (default 2 slots).
    pub fn tenant_slot(&self, tenant: &TenantId) -> Arc<Semaphore> {
        self.tenant_slots
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant_parallelism)))
            .clone()
    }
}

/// The resumable transfer engine.
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        transfers: Arc<Document<Vec<Transfer>>>,
        router: Arc<DriveRouter>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transfers,
                router,
                bus: EventBus::new(),
                speed: SpeedTracker::new(),
                controls: DashMap::new(),
                upload_slots: Arc::new(Semaphore::new(config.workers_per_direction)),
                download_slots: Arc::new(Semaphore::new(config.workers_per_direction)),
                tenant_slots: DashMap::new(),
                per_tenant_parallelism: config.per_tenant_parallelism,
                retry: RetryPolicy::from(config),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Subscribes to the transfer event stream.
    pub async fn subscribe(&self) -> mpsc::Receiver<TransferEvent> {
        self.inner.bus.subscribe().await
    }

    /// Startup reconciliation: interrupted work parks as `paused` so the
    /// user resumes it explicitly.
    pub async fn reconcile_on_startup(&self) -> EngineResult<()> {
        let demoted = self
            .inner
            .transfers
            .update(|all| {
                let mut demoted = 0usize;
                for t in all.iter_mut() {
                    if matches!(t.status, TransferStatus::Running | TransferStatus::Pending) {
                        t.mark_paused()?;
                        demoted += 1;
                    }
                }
                Ok(demoted)
            })
            .await?;
        if demoted > 0 {
            info!(demoted, "Interrupted transfers demoted to paused");
        }
        Ok(())
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Enqueues a single-file upload. With neither `tenant_id` nor
    /// `parent_token` the router picks the write target by order,
    /// permission, and capacity; a `parent_token` is only accepted together
    /// with the tenant that owns it.
    pub async fn upload_file(
        &self,
        group: Option<&GroupId>,
        tenant_id: Option<TenantId>,
        parent_token: Option<String>,
        local_path: PathBuf,
        task_id: Option<TaskId>,
    ) -> EngineResult<Transfer> {
        let meta = tokio::fs::metadata(&local_path).await?;
        if !meta.is_file() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a file",
                local_path.display()
            )));
        }
        let size = meta.len();
        let name = file_name_of(&local_path)?;

        let (tenant, parent_token) =
            self.resolve_write_target(group, tenant_id, parent_token, size).await?;
        self.inner
            .router
            .ensure_unique_name(&tenant, &parent_token, &name)
            .await?;

        let mut transfer = Transfer::new(TransferKind::FileUp, name);
        transfer.tenant_id = Some(tenant.id.clone());
        transfer.parent_token = Some(parent_token);
        transfer.local_path = Some(local_path);
        transfer.size = size;
        transfer.task_id = task_id;

        self.submit(transfer).await
    }

    /// Enqueues a folder upload: the tree is mirrored remotely and one child
    /// transfer is created per leaf file.
    pub async fn upload_folder(
        &self,
        group: Option<&GroupId>,
        tenant_id: Option<TenantId>,
        parent_token: Option<String>,
        local_dir: PathBuf,
    ) -> EngineResult<Transfer> {
        let meta = tokio::fs::metadata(&local_dir).await?;
        if !meta.is_dir() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }
        let name = file_name_of(&local_dir)?;

        let (tenant, parent_token) =
            self.resolve_write_target(group, tenant_id, parent_token, 0).await?;
        self.inner
            .router
            .ensure_unique_name(&tenant, &parent_token, &name)
            .await?;

        let mut transfer = Transfer::new(TransferKind::FolderUp, name);
        transfer.tenant_id = Some(tenant.id.clone());
        transfer.parent_token = Some(parent_token);
        transfer.local_path = Some(local_dir);

        self.submit(transfer).await
    }

    /// Enqueues a single-file download into `dest_dir`.
    pub async fn download_file(
        &self,
        tenant_id: TenantId,
        token: String,
        dest_dir: PathBuf,
        name: String,
        task_id: Option<TaskId>,
    ) -> EngineResult<Transfer> {
        let mut transfer = Transfer::new(TransferKind::FileDown, name);
        transfer.tenant_id = Some(tenant_id);
        transfer.resource_token = Some(token);
        transfer.local_path = Some(dest_dir);
        transfer.task_id = task_id;

        self.submit(transfer).await
    }

    /// Enqueues a folder download mirroring the remote tree under
    /// `dest_dir/<name>`.
    pub async fn download_folder(
        &self,
        tenant_id: TenantId,
        folder_token: String,
        dest_dir: PathBuf,
        name: String,
    ) -> EngineResult<Transfer> {
        let mut transfer = Transfer::new(TransferKind::FolderDown, name);
        transfer.tenant_id = Some(tenant_id);
        transfer.resource_token = Some(folder_token);
        transfer.local_path = Some(dest_dir);

        self.submit(transfer).await
    }

    async fn resolve_write_target(
        &self,
        group: Option<&GroupId>,
        tenant_id: Option<TenantId>,
        parent_token: Option<String>,
        size_hint: u64,
    ) -> EngineResult<(Tenant, String)> {
        match (tenant_id, parent_token) {
            (Some(tenant_id), Some(parent)) => {
                let tenant = self.inner.router.registry().get_tenant(&tenant_id).await?;
                Ok((tenant, parent))
            }
            (Some(tenant_id), None) => {
                let tenant = self.inner.router.registry().get_tenant(&tenant_id).await?;
                let (root, _) = self.inner.router.backend().list_root(&tenant).await?;
                Ok((tenant, root))
            }
            // A folder token is only meaningful within one tenant's
            // namespace; accepting it without the tenant would silently
            // reroute the write somewhere the caller did not ask for.
            (None, Some(_)) => Err(EngineError::InvalidArgument(
                "parent_token requires an explicit tenant_id".into(),
            )),
            (None, None) => self.inner.router.select_write_target(group, size_hint).await,
        }
    }

    async fn submit(&self, transfer: Transfer) -> EngineResult<Transfer> {
        let stored = transfer.clone();
        self.inner
            .transfers
            .update(move |all| {
                all.push(stored);
                Ok(())
            })
            .await?;
        self.inner
            .bus
            .publish(TransferEvent {
                transfer: transfer.clone(),
                speed_bps: 0,
            })
            .await;
        info!(transfer_id = %transfer.id, kind = ?transfer.kind, name = %transfer.name, "Transfer enqueued");
        self.spawn_worker(transfer.id.clone());
        Ok(transfer)
    }

    fn spawn_worker(&self, id: TransferId) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            run_transfer(inner, id).await;
        });
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Requests a pause. Takes effect after the current block completes;
    /// a transfer still pending parks immediately.
    pub async fn pause(&self, id: &TransferId) -> EngineResult<Transfer> {
        let transfer = self.inner.load(id).await?;
        if transfer.kind.is_folder() {
            return Err(EngineError::InvalidArgument(
                "folder transfers pause through their file children".into(),
            ));
        }
        match transfer.status {
            TransferStatus::Running | TransferStatus::Pending => {
                self.inner
                    .control(id)
                    .pause
                    .store(true, std::sync::atomic::Ordering::Release);
                Ok(self.inner.load(id).await?)
            }
            other => Err(EngineError::Conflict(format!(
                "cannot pause a {other} transfer"
            ))),
        }
    }

    /// Resumes a paused transfer from its persisted checkpoint.
    pub async fn resume(&self, id: &TransferId) -> EngineResult<Transfer> {
        let transfer = self.inner.load(id).await?;
        if transfer.status != TransferStatus::Paused {
            return Err(EngineError::Conflict(format!(
                "cannot resume a {} transfer",
                transfer.status
            )));
        }
        // Fresh control handle: the old pause flag must not re-park it.
        self.inner.controls.remove(id);
        self.spawn_worker(id.clone());
        Ok(transfer)
    }

    /// Cancels a transfer. A running worker notices within one block;
    /// pending or paused records fail immediately.
    pub async fn cancel(&self, id: &TransferId) -> EngineResult<Transfer> {
        let transfer = self.inner.load(id).await?;
        if transfer.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "cannot cancel a {} transfer",
                transfer.status
            )));
        }

        let control = self.inner.control(id);
        control.cancel.cancel();

        if transfer.kind.is_folder() {
            // Cascade to live children; the folder worker sees the token.
            let children: Vec<TransferId> = self
                .inner
                .transfers
                .read({
                    let id = id.clone();
                    move |all| {
                        all.iter()
                            .filter(|t| t.parent_id.as_ref() == Some(&id) && !t.status.is_terminal())
                            .map(|t| t.id.clone())
                            .collect()
                    }
                })
                .await?;
            for child in children {
                self.inner.control(&child).cancel.cancel();
                let _ = self.fail_if_idle(&child, "cancelled").await;
            }
        }

        self.fail_if_idle(id, "cancelled").await?;
        self.inner.load(id).await
    }

    /// Fails a record now when no worker owns it (pending or paused).
    async fn fail_if_idle(&self, id: &TransferId, message: &str) -> EngineResult<()> {
        let message = message.to_string();
        let result = self
            .inner
            .mutate(id, move |t| {
                match t.status {
                    TransferStatus::Pending | TransferStatus::Paused => t.mark_failed(message),
                    // A live worker will observe the cancel token instead.
                    _ => Ok(()),
                }
            })
            .await;
        result.map(|_| ())
    }

    /// Rebuilds a failed transfer as a fresh pending record.
    pub async fn restart(&self, id: &TransferId) -> EngineResult<Transfer> {
        let transfer = self.inner.load(id).await?;
        if transfer.status != TransferStatus::Failed {
            return Err(EngineError::Conflict(format!(
                "restart requires a failed transfer, this one is {}",
                transfer.status
            )));
        }
        self.submit(transfer.restarted()).await
    }

    // ========================================================================
    // Queries and maintenance
    // ========================================================================

    pub async fn get(&self, id: &TransferId) -> EngineResult<Transfer> {
        self.inner.load(id).await
    }

    /// All transfers, newest first.
    pub async fn list(&self) -> EngineResult<Vec<Transfer>> {
        let mut all = self.inner.transfers.read(|all| all.clone()).await?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    /// Removes terminal records, returning how many were dropped.
    pub async fn clear_finished(&self) -> EngineResult<usize> {
        self.inner
            .transfers
            .update(|all| {
                let before = all.len();
                all.retain(|t| !t.status.is_terminal());
                Ok(before - all.len())
            })
            .await
    }

    /// Tenant-removal cascade: every in-flight transfer bound to the tenant
    /// fails with the given message.
    pub async fn fail_tenant_transfers(
        &self,
        tenant_id: &TenantId,
        message: &str,
    ) -> EngineResult<usize> {
        let affected: Vec<TransferId> = self
            .inner
            .transfers
            .read({
                let tenant_id = tenant_id.clone();
                move |all| {
                    all.iter()
                        .filter(|t| t.tenant_id.as_ref() == Some(&tenant_id) && !t.status.is_terminal())
                        .map(|t| t.id.clone())
                        .collect()
                }
            })
            .await?;

        for id in &affected {
            self.inner.control(id).cancel.cancel();
            let message = message.to_string();
            let result = self
                .inner
                .mutate(id, move |t| {
                    if !t.status.is_terminal() {
                        t.mark_failed(message)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                warn!(transfer_id = %id, error = %err, "Failed to cascade tenant removal");
            }
        }
        Ok(affected.len())
    }

    /// Waits until the transfer reaches a terminal status and returns the
    /// final record.
    pub async fn await_terminal(&self, id: &TransferId) -> EngineResult<Transfer> {
        let mut rx = self.subscribe().await;
        let current = self.inner.load(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        while let Some(event) = rx.recv().await {
            if event.transfer.id == *id && event.is_terminal() {
                return Ok(event.transfer);
            }
        }
        // Bus closed (engine dropped); fall back to the document.
        self.inner.load(id).await
    }

    /// Waits for in-flight workers to finish (shutdown path).
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Persists and spawns a child transfer created by a folder worker.
pub(crate) async fn submit_child(
    inner: &Arc<EngineInner>,
    transfer: Transfer,
) -> EngineResult<TransferId> {
    let id = transfer.id.clone();
    let stored = transfer.clone();
    inner
        .transfers
        .update(move |all| {
            all.push(stored);
            Ok(())
        })
        .await?;
    inner
        .bus
        .publish(TransferEvent {
            transfer,
            speed_bps: 0,
        })
        .await;
    let inner = Arc::clone(inner);
    let spawned = id.clone();
    inner.tracker.clone().spawn(async move {
        run_transfer(inner, spawned).await;
    });
    Ok(id)
}

/// Folder-worker monitor loop: tracks the children of `folder_id`, rolling
/// their progress into the folder record, until every child is terminal.
/// Returns `(succeeded, failed)` counts.
pub(crate) async fn monitor_children(
    inner: &Arc<EngineInner>,
    folder_id: &TransferId,
    control: &ControlHandle,
) -> EngineResult<(usize, usize)> {
    loop {
        if control.cancel.is_cancelled() {
            let children: Vec<TransferId> = inner
                .transfers
                .read({
                    let folder_id = folder_id.clone();
                    move |all| {
                        all.iter()
                            .filter(|t| t.parent_id.as_ref() == Some(&folder_id) && !t.status.is_terminal())
                            .map(|t| t.id.clone())
                            .collect()
                    }
                })
                .await?;
            for child in children {
                inner.control(&child).cancel.cancel();
            }
            return Err(EngineError::Cancelled);
        }

        let (sum, total, done, failed) = inner
            .transfers
            .read({
                let folder_id = folder_id.clone();
                move |all| {
                    let children: Vec<&Transfer> = all
                        .iter()
                        .filter(|t| t.parent_id.as_ref() == Some(&folder_id))
                        .collect();
                    let sum: u64 = children.iter().map(|t| t.transferred).sum();
                    let done = children.iter().filter(|t| t.status.is_terminal()).count();
                    let failed = children
                        .iter()
                        .filter(|t| t.status == TransferStatus::Failed)
                        .count();
                    (sum, children.len(), done, failed)
                }
            })
            .await?;

        inner
            .mutate(folder_id, move |t| {
                t.transferred = if t.size > 0 { sum.min(t.size) } else { sum };
                Ok(())
            })
            .await?;

        if done == total {
            return Ok((total - failed, failed));
        }
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }
}

/// Worker entry point: dispatch by kind, translate executor errors into the
/// terminal failure state.
pub(crate) fn run_transfer(
    inner: Arc<EngineInner>,
    id: TransferId,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let kind = match inner.load(&id).await {
            Ok(t) => t.kind,
            Err(err) => {
                warn!(transfer_id = %id, error = %err, "Worker could not load transfer");
                return;
            }
        };

        let result = match kind {
            TransferKind::FileUp => upload::run_file(&inner, &id).await,
            TransferKind::FolderUp => upload::run_folder(&inner, &id).await,
            TransferKind::FileDown => download::run_file(&inner, &id).await,
            TransferKind::FolderDown => download::run_folder(&inner, &id).await,
        };

        if let Err(err) = result {
            let message = match &err {
                EngineError::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            let outcome = inner
                .mutate(&id, move |t| {
                    if !t.status.is_terminal() {
                        t.mark_failed(message)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = outcome {
                warn!(transfer_id = %id, error = %err, "Failed to record transfer failure");
            }
        }
        inner.controls.remove(&id);
    })
}

fn file_name_of(path: &std::path::Path) -> EngineResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| {
            EngineError::InvalidArgument(format!("{} has no usable file name", path.display()))
        })
}
