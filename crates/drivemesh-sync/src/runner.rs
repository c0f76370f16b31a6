//! Sync runner: plan execution and snapshot bookkeeping
//!
//! A run enumerates both sides, diffs them against the task's snapshot,
//! feeds the resulting transfers into the transfer engine (tagged with the
//! task id), applies deletes directly, and, only when every action
//! succeeded, rebuilds the snapshot by re-enumeration. A failed run leaves
//! the snapshot untouched so the next run retries the same plan.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use drivemesh_core::domain::{
    DetectionMode, EngineError, EngineResult, SnapshotEntry, SyncSnapshot, SyncTask, Tenant,
    TransferStatus,
};
use drivemesh_core::ports::{DriveBackend, EntryKind};
use drivemesh_router::DriveRouter;
use drivemesh_store::SnapshotStore;
use drivemesh_transfer::TransferEngine;

use crate::diff::{self, SyncAction};
use crate::enumerate::{enumerate_local, enumerate_remote};
use crate::filter::GlobFilter;

/// Counts of what one run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub downloads: usize,
    pub uploads: usize,
    pub remote_deletes: usize,
    pub local_deletes: usize,
}

impl RunSummary {
    pub fn actions(&self) -> usize {
        self.downloads + self.uploads + self.remote_deletes + self.local_deletes
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} actions ({} down, {} up, {} remote del, {} local del)",
            self.actions(),
            self.downloads,
            self.uploads,
            self.remote_deletes,
            self.local_deletes
        )
    }
}

/// Executes sync tasks against the transfer engine.
pub struct SyncRunner {
    router: Arc<DriveRouter>,
    engine: Arc<TransferEngine>,
    snapshots: Arc<SnapshotStore>,
}

impl SyncRunner {
    pub fn new(
        router: Arc<DriveRouter>,
        engine: Arc<TransferEngine>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            router,
            engine,
            snapshots,
        }
    }

    /// Runs one task to completion.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, name = %task.name))]
    pub async fn run(&self, task: &SyncTask) -> EngineResult<RunSummary> {
        let tenant = self.router.registry().get_tenant(&task.tenant_id).await?;
        let filter = GlobFilter::new(&task.include_globs, &task.exclude_globs)?;
        let want_checksums = task.detection == DetectionMode::Checksum;
        let backend = self.router.backend();

        let snapshot = self
            .snapshots
            .load(&task.id)
            .await?
            .map(|s| s.entries)
            .unwrap_or_default();

        let remote = enumerate_remote(
            backend.as_ref(),
            &tenant,
            &task.remote_folder_token,
            &filter,
            want_checksums,
        )
        .await?;
        let local = enumerate_local(&task.local_path, &filter, want_checksums).await?;

        let actions = diff::plan(
            task.direction,
            task.detection,
            task.conflict,
            task.propagate_delete,
            &remote,
            &local,
            &snapshot,
        );
        info!(actions = actions.len(), "Sync plan computed");

        let summary = self.execute(task, &tenant, actions).await?;

        // Snapshot: the re-enumerated local tree, joined with remote tokens.
        let local_after = enumerate_local(&task.local_path, &filter, want_checksums).await?;
        let remote_after = enumerate_remote(
            backend.as_ref(),
            &tenant,
            &task.remote_folder_token,
            &filter,
            false,
        )
        .await?;

        let mut entries: BTreeMap<String, SnapshotEntry> = BTreeMap::new();
        for (rel, file) in &local_after {
            entries.insert(
                rel.clone(),
                SnapshotEntry {
                    size: file.size,
                    mtime: file.mtime,
                    remote_token: remote_after.get(rel).map(|r| r.token.clone()),
                    checksum: file.checksum,
                },
            );
        }
        self.snapshots
            .save(&SyncSnapshot {
                task_id: task.id.clone(),
                captured_at: Utc::now(),
                entries,
            })
            .await?;

        info!(%summary, "Sync run committed");
        Ok(summary)
    }

    /// Executes the plan: transfers through the engine, deletes directly.
    async fn execute(
        &self,
        task: &SyncTask,
        tenant: &Tenant,
        actions: Vec<SyncAction>,
    ) -> EngineResult<RunSummary> {
        let backend = self.router.backend();
        let mut summary = RunSummary::default();
        let mut transfer_ids = Vec::new();
        let mut remote_dirs = RemoteDirCache::new(task.remote_folder_token.clone());

        for action in &actions {
            match action {
                SyncAction::Download { rel, token } => {
                    let target = task.local_path.join(rel);
                    let dest_dir = target
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| task.local_path.clone());
                    tokio::fs::create_dir_all(&dest_dir).await?;
                    // Replace semantics: clear the stale local copy so the
                    // engine's collision suffixing never kicks in.
                    if tokio::fs::metadata(&target).await.is_ok() {
                        tokio::fs::remove_file(&target).await?;
                    }
                    let name = rel.rsplit('/').next().unwrap_or(rel).to_string();
                    let transfer = self
                        .engine
                        .download_file(
                            tenant.id.clone(),
                            token.clone(),
                            dest_dir,
                            name,
                            Some(task.id.clone()),
                        )
                        .await?;
                    transfer_ids.push(transfer.id);
                    summary.downloads += 1;
                }

                SyncAction::Upload { rel, replaces } => {
                    if let Some(stale) = replaces {
                        backend
                            .delete_entry(tenant, stale, EntryKind::File)
                            .await?;
                    }
                    let parent = remote_dirs
                        .ensure(backend.as_ref(), tenant, dir_of(rel))
                        .await?;
                    let transfer = self
                        .engine
                        .upload_file(
                            None,
                            Some(tenant.id.clone()),
                            Some(parent),
                            task.local_path.join(rel),
                            Some(task.id.clone()),
                        )
                        .await?;
                    transfer_ids.push(transfer.id);
                    summary.uploads += 1;
                }

                SyncAction::DeleteRemote { rel, token } => {
                    backend
                        .delete_entry(tenant, token, EntryKind::File)
                        .await?;
                    info!(rel = %rel, "Remote file deleted");
                    summary.remote_deletes += 1;
                }

                SyncAction::DeleteLocal { rel } => {
                    let path = task.local_path.join(rel);
                    if tokio::fs::metadata(&path).await.is_ok() {
                        tokio::fs::remove_file(&path).await?;
                    }
                    info!(rel = %rel, "Local file deleted");
                    summary.local_deletes += 1;
                }
            }
        }

        // Await every transfer's terminal event; one failure fails the run.
        let mut failures = Vec::new();
        for id in transfer_ids {
            let done = self.engine.await_terminal(&id).await?;
            if done.status == TransferStatus::Failed {
                failures.push(format!(
                    "{}: {}",
                    done.name,
                    done.message.unwrap_or_else(|| "failed".into())
                ));
            }
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), "Sync run had failed transfers");
            return Err(EngineError::Conflict(format!(
                "{} of the run's transfers failed: {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        Ok(summary)
    }
}

/// Resolves and creates remote directories for upload targets, one backend
/// round-trip per distinct directory.
struct RemoteDirCache {
    root_token: String,
    by_rel: HashMap<String, String>,
}

impl RemoteDirCache {
    fn new(root_token: String) -> Self {
        Self {
            root_token,
            by_rel: HashMap::new(),
        }
    }

    async fn ensure(
        &mut self,
        backend: &dyn DriveBackend,
        tenant: &Tenant,
        dir_rel: &str,
    ) -> EngineResult<String> {
        if dir_rel.is_empty() {
            return Ok(self.root_token.clone());
        }
        if let Some(token) = self.by_rel.get(dir_rel) {
            return Ok(token.clone());
        }

        let mut current = self.root_token.clone();
        let mut walked = String::new();
        for component in dir_rel.split('/') {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(component);

            if let Some(token) = self.by_rel.get(&walked) {
                current = token.clone();
                continue;
            }

            let entries = backend.list_folder(tenant, &current).await?;
            let token = match entries
                .iter()
                .find(|e| e.name == component && e.kind.is_folder())
            {
                Some(existing) => existing.token.clone(),
                None => backend.create_folder(tenant, &current, component).await?,
            };
            self.by_rel.insert(walked.clone(), token.clone());
            current = token;
        }
        Ok(current)
    }
}

fn dir_of(rel: &str) -> &str {
    match rel.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

// ============================================================================
// Scheduler integration
// ============================================================================

#[async_trait::async_trait]
impl drivemesh_sched::TaskDispatcher for SyncRunner {
    async fn run_task(&self, task: SyncTask) -> Result<String, String> {
        match self.run(&task).await {
            Ok(summary) => Ok(summary.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}
