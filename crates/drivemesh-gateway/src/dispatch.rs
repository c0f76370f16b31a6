//! Command execution
//!
//! Maps each parsed [`Command`] onto the engine handles, applying the scope
//! rules first: admin-only commands reject group keys, and any command that
//! addresses a tenant verifies membership before touching state, so a
//! denied request has no side effects.

use chrono::Utc;
use serde_json::{json, Value};

use drivemesh_core::config::EngineConfig;
use drivemesh_core::domain::{
    ConflictPolicy, DetectionMode, EngineError, EngineResult, SyncTask, TaskId, TaskStatus,
    Tenant, TransferId,
};
use drivemesh_sched::CronExpr;

use crate::auth::Scope;
use crate::commands::*;
use crate::GatewayContext;

/// Executes one command under a resolved scope.
pub async fn dispatch(
    ctx: &GatewayContext,
    scope: &Scope,
    command: Command,
) -> EngineResult<Value> {
    match command {
        // ------------------------------------------------------------------
        // Tenants
        // ------------------------------------------------------------------
        Command::AddTenant(p) => {
            scope.require_admin("add_tenant")?;
            let mut tenant = Tenant::new(
                p.display_name,
                drivemesh_core::domain::AppCredentials {
                    app_id: p.app_id,
                    app_secret: p.app_secret,
                },
                p.platform,
                p.order.unwrap_or(0),
            );
            if let Some(permission) = p.permission {
                tenant.permission = permission;
            }
            if let Some(quota) = p.quota_bytes {
                tenant.quota_bytes = quota;
            }
            let added = ctx.registry.add_tenant(tenant).await?;
            Ok(tenant_view(&added))
        }

        Command::UpdateTenant(p) => {
            scope.require_admin("update_tenant")?;
            let updated = ctx
                .registry
                .update_tenant(&p.id, |tenant| {
                    if let Some(name) = p.display_name {
                        tenant.display_name = name;
                    }
                    if let Some(permission) = p.permission {
                        tenant.permission = permission;
                    }
                    if let Some(active) = p.active {
                        tenant.active = active;
                    }
                    if let Some(order) = p.order {
                        tenant.order = order;
                    }
                })
                .await?;
            Ok(tenant_view(&updated))
        }

        Command::RemoveTenant(p) => {
            scope.require_admin("remove_tenant")?;
            let removed = ctx.registry.remove_tenant(&p.id).await?;
            let cancelled = ctx
                .transfers
                .fail_tenant_transfers(&p.id, "tenant removed")
                .await?;
            Ok(json!({
                "removed": removed.id,
                "cancelled_transfers": cancelled,
            }))
        }

        Command::ListTenants => {
            let tenants = ctx.registry.tenants_in_scope(scope.group_id()).await?;
            Ok(Value::Array(tenants.iter().map(tenant_view).collect()))
        }

        Command::RefreshQuota(p) => {
            scope.require_tenant(&p.id)?;
            let updated = ctx.router.refresh_quota(&p.id).await?;
            Ok(tenant_view(&updated))
        }

        // ------------------------------------------------------------------
        // Groups
        // ------------------------------------------------------------------
        Command::AddGroup(p) => {
            scope.require_admin("add_group")?;
            let group = ctx.registry.add_group(p.name, p.remark, p.tenant_ids).await?;
            to_value(&group)
        }

        Command::UpdateGroup(p) => {
            scope.require_admin("update_group")?;
            let updated = ctx
                .registry
                .update_group(&p.id, |group| {
                    if let Some(name) = p.name {
                        group.name = name;
                    }
                    if let Some(remark) = p.remark {
                        group.remark = remark;
                    }
                    if let Some(tenant_ids) = p.tenant_ids {
                        group.tenant_ids = tenant_ids;
                    }
                })
                .await?;
            to_value(&updated)
        }

        Command::RemoveGroup(p) => {
            scope.require_admin("remove_group")?;
            let removed = ctx.registry.remove_group(&p.id).await?;
            Ok(json!({ "removed": removed.id }))
        }

        Command::ListGroups => match scope {
            Scope::Admin => to_value(&ctx.registry.list_groups().await?),
            Scope::Group(own) => to_value(&vec![ctx.registry.get_group(&own.id).await?]),
        },

        Command::RegenerateGroupKey(p) => {
            scope.require_admin("regenerate_group_key")?;
            let updated = ctx.registry.regenerate_group_key(&p.id).await?;
            to_value(&updated)
        }

        // ------------------------------------------------------------------
        // Browsing
        // ------------------------------------------------------------------
        Command::ListRoot(p) => {
            let group = match scope {
                Scope::Admin => p.group_id,
                // A scoped key always sees exactly its own federation.
                Scope::Group(own) => Some(own.id.clone()),
            };
            let slices = ctx.router.aggregated_root(group.as_ref()).await?;
            to_value(&slices)
        }

        Command::ListFolder(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let tenant = ctx.registry.get_tenant(&p.tenant_id).await?;
            let entries = ctx
                .router
                .backend()
                .list_folder(&tenant, &p.folder_token)
                .await?;
            to_value(&entries)
        }

        Command::CreateFolder(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let tenant = ctx.registry.get_tenant(&p.tenant_id).await?;
            let token = ctx
                .router
                .create_folder(&tenant, &p.parent_token, &p.name)
                .await?;
            Ok(json!({ "token": token }))
        }

        Command::MoveEntry(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let tenant = ctx.registry.get_tenant(&p.tenant_id).await?;
            ctx.router
                .move_entry(&tenant, &p.token, &p.new_parent)
                .await?;
            Ok(json!({ "moved": p.token }))
        }

        Command::CopyEntry(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let tenant = ctx.registry.get_tenant(&p.tenant_id).await?;
            let token = ctx
                .router
                .copy_entry(&tenant, &p.token, &p.new_parent, &p.new_name)
                .await?;
            Ok(json!({ "token": token }))
        }

        Command::DeleteEntry(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let tenant = ctx.registry.get_tenant(&p.tenant_id).await?;
            ctx.router.delete_entry(&tenant, &p.token, p.kind).await?;
            Ok(json!({ "deleted": p.token }))
        }

        // ------------------------------------------------------------------
        // Transfers
        // ------------------------------------------------------------------
        Command::UploadFile(p) => {
            if let Some(tenant_id) = &p.tenant_id {
                scope.require_tenant(tenant_id)?;
            }
            let transfer = ctx
                .transfers
                .upload_file(scope.group_id(), p.tenant_id, p.parent_token, p.local_path, None)
                .await?;
            to_value(&transfer)
        }

        Command::UploadFolder(p) => {
            if let Some(tenant_id) = &p.tenant_id {
                scope.require_tenant(tenant_id)?;
            }
            let transfer = ctx
                .transfers
                .upload_folder(scope.group_id(), p.tenant_id, p.parent_token, p.local_path)
                .await?;
            to_value(&transfer)
        }

        Command::DownloadFile(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let transfer = ctx
                .transfers
                .download_file(p.tenant_id, p.token, p.dest_dir, p.name, None)
                .await?;
            to_value(&transfer)
        }

        Command::DownloadFolder(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let transfer = ctx
                .transfers
                .download_folder(p.tenant_id, p.folder_token, p.dest_dir, p.name)
                .await?;
            to_value(&transfer)
        }

        Command::PauseTransfer(p) => {
            transfer_in_scope(ctx, scope, &p.id).await?;
            to_value(&ctx.transfers.pause(&p.id).await?)
        }
        Command::ResumeTransfer(p) => {
            transfer_in_scope(ctx, scope, &p.id).await?;
            to_value(&ctx.transfers.resume(&p.id).await?)
        }
        Command::CancelTransfer(p) => {
            transfer_in_scope(ctx, scope, &p.id).await?;
            to_value(&ctx.transfers.cancel(&p.id).await?)
        }
        Command::RestartTransfer(p) => {
            transfer_in_scope(ctx, scope, &p.id).await?;
            to_value(&ctx.transfers.restart(&p.id).await?)
        }

        Command::ListTransfers => {
            let all = ctx.transfers.list().await?;
            let visible: Vec<_> = all
                .into_iter()
                .filter(|t| match &t.tenant_id {
                    Some(tenant_id) => scope.allows_tenant(tenant_id),
                    None => scope.is_admin(),
                })
                .collect();
            to_value(&visible)
        }

        Command::ClearFinished => {
            scope.require_admin("clear_finished")?;
            let cleared = ctx.transfers.clear_finished().await?;
            Ok(json!({ "cleared": cleared }))
        }

        // ------------------------------------------------------------------
        // Tasks
        // ------------------------------------------------------------------
        Command::AddTask(p) => {
            scope.require_tenant(&p.tenant_id)?;
            let cron = CronExpr::parse(&p.schedule)?;

            let mut task = SyncTask::new(
                p.name,
                p.direction,
                p.tenant_id,
                p.remote_folder_token,
                p.local_path,
                p.schedule,
            );
            task.group_id = scope.group_id().cloned();
            task.enabled = p.enabled.unwrap_or(true);
            task.detection = p.detection.unwrap_or(DetectionMode::SizeMtime);
            task.conflict = p.conflict.unwrap_or(ConflictPolicy::Newest);
            task.propagate_delete = p.propagate_delete.unwrap_or(false);
            task.include_globs = p.include_globs;
            task.exclude_globs = p.exclude_globs;
            task.notes = p.notes;
            if task.enabled {
                task.next_run_at = cron.next_after(Utc::now());
                task.last_status = TaskStatus::Scheduled;
            }

            let stored = task.clone();
            ctx.tasks
                .update(move |tasks| {
                    tasks.push(stored);
                    Ok(())
                })
                .await?;
            to_value(&task)
        }

        Command::UpdateTask(p) => {
            let existing = task_in_scope(ctx, scope, &p.id).await?;
            if existing.last_status == TaskStatus::Running {
                return Err(EngineError::Conflict(format!(
                    "task {} is running; try again after it completes",
                    p.id
                )));
            }
            let schedule = p.schedule.clone().unwrap_or(existing.schedule);
            let cron = CronExpr::parse(&schedule)?;
            let next = cron.next_after(Utc::now());

            let id = p.id.clone();
            let updated = ctx
                .tasks
                .update(move |tasks| {
                    let task = tasks
                        .iter_mut()
                        .find(|t| t.id == id)
                        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
                    if let Some(name) = p.name {
                        task.name = name;
                    }
                    if let Some(direction) = p.direction {
                        task.direction = direction;
                    }
                    if let Some(token) = p.remote_folder_token {
                        task.remote_folder_token = token;
                    }
                    if let Some(path) = p.local_path {
                        task.local_path = path;
                    }
                    if let Some(schedule) = p.schedule {
                        task.schedule = schedule;
                    }
                    if let Some(detection) = p.detection {
                        task.detection = detection;
                    }
                    if let Some(conflict) = p.conflict {
                        task.conflict = conflict;
                    }
                    if let Some(propagate) = p.propagate_delete {
                        task.propagate_delete = propagate;
                    }
                    if let Some(includes) = p.include_globs {
                        task.include_globs = includes;
                    }
                    if let Some(excludes) = p.exclude_globs {
                        task.exclude_globs = excludes;
                    }
                    if let Some(notes) = p.notes {
                        task.notes = notes;
                    }
                    task.next_run_at = if task.enabled { next } else { None };
                    Ok(task.clone())
                })
                .await?;
            to_value(&updated)
        }

        Command::RemoveTask(p) => {
            task_in_scope(ctx, scope, &p.id).await?;
            let id = p.id.clone();
            ctx.tasks
                .update(move |tasks| {
                    let before = tasks.len();
                    tasks.retain(|t| t.id != id);
                    if tasks.len() == before {
                        return Err(EngineError::NotFound(format!("task {id}")));
                    }
                    Ok(())
                })
                .await?;
            ctx.snapshots.delete(&p.id).await?;
            Ok(json!({ "removed": p.id }))
        }

        Command::ListTasks => {
            let all = ctx.tasks.read(|tasks| tasks.clone()).await?;
            let visible: Vec<_> = all
                .into_iter()
                .filter(|t| scope.allows_tenant(&t.tenant_id))
                .collect();
            to_value(&visible)
        }

        Command::EnableTask(p) => set_task_enabled(ctx, scope, &p.id, true).await,
        Command::DisableTask(p) => set_task_enabled(ctx, scope, &p.id, false).await,

        Command::RunTask(p) => {
            task_in_scope(ctx, scope, &p.id).await?;
            ctx.scheduler.trigger_now(&p.id).await?;
            Ok(json!({ "triggered": p.id }))
        }

        // ------------------------------------------------------------------
        // Logs, config, service
        // ------------------------------------------------------------------
        Command::QueryLogs(p) => {
            let limit = p.limit.unwrap_or(100).min(1000);
            let mut entries = ctx
                .audit
                .query(p.command.as_deref(), p.status, limit)
                .await?;
            if let Scope::Group(own) = scope {
                let label = own.id.to_string();
                entries.retain(|e| e.scope == label);
            }
            to_value(&entries)
        }

        Command::GetConfig => {
            scope.require_admin("get_config")?;
            let mut config = ctx.config.read(|c| c.clone()).await?;
            // The admin key never travels back over the wire.
            config.gateway.admin_api_key = None;
            to_value(&config)
        }

        Command::UpdateConfig(p) => {
            scope.require_admin("update_config")?;
            let incoming: EngineConfig = serde_json::from_value(p.config)
                .map_err(|e| EngineError::InvalidArgument(format!("config: {e}")))?;
            let errors = incoming.validate();
            if !errors.is_empty() {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(EngineError::InvalidArgument(joined));
            }
            let mut updated = ctx
                .config
                .update(move |config| {
                    let admin_key = config.gateway.admin_api_key.take();
                    *config = incoming;
                    // The admin key is process-owned, never client-supplied.
                    config.gateway.admin_api_key = admin_key;
                    Ok(config.clone())
                })
                .await?;
            updated.gateway.admin_api_key = None;
            to_value(&updated)
        }

        Command::StartService => {
            scope.require_admin("start_service")?;
            ctx.service.set_running(true);
            Ok(json!({ "running": true }))
        }

        Command::StopService => {
            scope.require_admin("stop_service")?;
            ctx.service.set_running(false);
            Ok(json!({ "running": false }))
        }
    }
}

/// Serializable view of a tenant with its secrets stripped.
fn tenant_view(tenant: &Tenant) -> Value {
    json!({
        "id": tenant.id,
        "display_name": tenant.display_name,
        "app_id": tenant.app_credentials.app_id,
        "platform": tenant.platform,
        "quota_bytes": tenant.quota_bytes,
        "used_bytes": tenant.used_bytes,
        "permission": tenant.permission,
        "active": tenant.active,
        "order": tenant.order,
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::LocalIo(format!("serialize response: {e}")))
}

/// Loads a task and verifies its tenant is inside the scope.
async fn task_in_scope(
    ctx: &GatewayContext,
    scope: &Scope,
    id: &TaskId,
) -> EngineResult<SyncTask> {
    let target = id.clone();
    let task = ctx
        .tasks
        .read(move |tasks| tasks.iter().find(|t| t.id == target).cloned())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
    scope.require_tenant(&task.tenant_id)?;
    Ok(task)
}

/// Loads a transfer and verifies its tenant is inside the scope.
async fn transfer_in_scope(
    ctx: &GatewayContext,
    scope: &Scope,
    id: &TransferId,
) -> EngineResult<()> {
    let transfer = ctx.transfers.get(id).await?;
    match &transfer.tenant_id {
        Some(tenant_id) => scope.require_tenant(tenant_id),
        None => scope.require_admin("transfer control"),
    }
}

async fn set_task_enabled(
    ctx: &GatewayContext,
    scope: &Scope,
    id: &TaskId,
    enabled: bool,
) -> EngineResult<Value> {
    let existing = task_in_scope(ctx, scope, id).await?;
    let next = if enabled {
        CronExpr::parse(&existing.schedule)?.next_after(Utc::now())
    } else {
        None
    };

    let target = id.clone();
    let updated = ctx
        .tasks
        .update(move |tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == target)
                .ok_or_else(|| EngineError::NotFound(format!("task {target}")))?;
            task.enabled = enabled;
            task.next_run_at = next;
            if enabled && task.last_status == TaskStatus::Idle {
                task.last_status = TaskStatus::Scheduled;
            }
            Ok(task.clone())
        })
        .await?;
    to_value(&updated)
}
