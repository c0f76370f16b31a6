//! The typed command set
//!
//! Each `POST /command/<name>` body deserializes into one variant here.
//! Every parameter struct denies unknown fields, so a client typo is a
//! `400` rather than a silently ignored option. An empty body is accepted
//! for commands that take no parameters.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Deserialize;

use drivemesh_core::domain::{
    ApiCallStatus, ConflictPolicy, DetectionMode, GroupId, Permission, Platform, SyncDirection,
    TaskId, TenantId, TransferId,
};
use drivemesh_core::domain::{EngineError, EngineResult};
use drivemesh_core::ports::EntryKind;

// ============================================================================
// Tenant commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddTenantParams {
    pub display_name: String,
    pub app_id: String,
    pub app_secret: String,
    pub platform: Platform,
    #[serde(default)]
    pub permission: Option<Permission>,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTenantParams {
    pub id: TenantId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub permission: Option<Permission>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub order: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantIdParams {
    pub id: TenantId,
}

// ============================================================================
// Group commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddGroupParams {
    pub name: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub tenant_ids: BTreeSet<TenantId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateGroupParams {
    pub id: GroupId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub tenant_ids: Option<BTreeSet<TenantId>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupIdParams {
    pub id: GroupId,
}

// ============================================================================
// Browsing commands
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ListRootParams {
    /// Admin keys may narrow the federation to one group.
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListFolderParams {
    pub tenant_id: TenantId,
    pub folder_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateFolderParams {
    pub tenant_id: TenantId,
    pub parent_token: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveEntryParams {
    pub tenant_id: TenantId,
    pub token: String,
    pub new_parent: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyEntryParams {
    pub tenant_id: TenantId,
    pub token: String,
    pub new_parent: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteEntryParams {
    pub tenant_id: TenantId,
    pub token: String,
    pub kind: EntryKind,
}

// ============================================================================
// Transfer commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadParams {
    /// Explicit target tenant; when absent the router picks one.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub parent_token: Option<String>,
    pub local_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadFileParams {
    pub tenant_id: TenantId,
    pub token: String,
    pub dest_dir: PathBuf,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadFolderParams {
    pub tenant_id: TenantId,
    pub folder_token: String,
    pub dest_dir: PathBuf,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferIdParams {
    pub id: TransferId,
}

// ============================================================================
// Task commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddTaskParams {
    pub name: String,
    pub direction: SyncDirection,
    pub tenant_id: TenantId,
    pub remote_folder_token: String,
    pub local_path: PathBuf,
    pub schedule: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub detection: Option<DetectionMode>,
    #[serde(default)]
    pub conflict: Option<ConflictPolicy>,
    #[serde(default)]
    pub propagate_delete: Option<bool>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTaskParams {
    pub id: TaskId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub direction: Option<SyncDirection>,
    #[serde(default)]
    pub remote_folder_token: Option<String>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub detection: Option<DetectionMode>,
    #[serde(default)]
    pub conflict: Option<ConflictPolicy>,
    #[serde(default)]
    pub propagate_delete: Option<bool>,
    #[serde(default)]
    pub include_globs: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_globs: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskIdParams {
    pub id: TaskId,
}

// ============================================================================
// Logs and config
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct QueryLogsParams {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub status: Option<ApiCallStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfigParams {
    pub config: serde_json::Value,
}

// ============================================================================
// The command set
// ============================================================================

#[derive(Debug)]
pub enum Command {
    AddTenant(AddTenantParams),
    UpdateTenant(UpdateTenantParams),
    RemoveTenant(TenantIdParams),
    ListTenants,
    RefreshQuota(TenantIdParams),

    AddGroup(AddGroupParams),
    UpdateGroup(UpdateGroupParams),
    RemoveGroup(GroupIdParams),
    ListGroups,
    RegenerateGroupKey(GroupIdParams),

    ListRoot(ListRootParams),
    ListFolder(ListFolderParams),
    CreateFolder(CreateFolderParams),
    MoveEntry(MoveEntryParams),
    CopyEntry(CopyEntryParams),
    DeleteEntry(DeleteEntryParams),

    UploadFile(UploadParams),
    UploadFolder(UploadParams),
    DownloadFile(DownloadFileParams),
    DownloadFolder(DownloadFolderParams),
    PauseTransfer(TransferIdParams),
    ResumeTransfer(TransferIdParams),
    CancelTransfer(TransferIdParams),
    RestartTransfer(TransferIdParams),
    ListTransfers,
    ClearFinished,

    AddTask(AddTaskParams),
    UpdateTask(UpdateTaskParams),
    RemoveTask(TaskIdParams),
    ListTasks,
    EnableTask(TaskIdParams),
    DisableTask(TaskIdParams),
    RunTask(TaskIdParams),

    QueryLogs(QueryLogsParams),
    GetConfig,
    UpdateConfig(UpdateConfigParams),
    StartService,
    StopService,
}

fn body_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> EngineResult<T> {
    let body = if body.is_empty() { b"{}" } else { body };
    serde_json::from_slice(body)
        .map_err(|e| EngineError::InvalidArgument(format!("request body: {e}")))
}

impl Command {
    /// Parses `/command/<name>` plus its JSON body.
    ///
    /// An unknown name is `NotFound` (the gateway's 404); a malformed or
    /// over-specified body is `InvalidArgument` (400).
    pub fn parse(name: &str, body: &[u8]) -> EngineResult<Command> {
        Ok(match name {
            "add_tenant" => Command::AddTenant(body_json(body)?),
            "update_tenant" => Command::UpdateTenant(body_json(body)?),
            "remove_tenant" => Command::RemoveTenant(body_json(body)?),
            "list_tenants" => Command::ListTenants,
            "refresh_quota" => Command::RefreshQuota(body_json(body)?),

            "add_group" => Command::AddGroup(body_json(body)?),
            "update_group" => Command::UpdateGroup(body_json(body)?),
            "remove_group" => Command::RemoveGroup(body_json(body)?),
            "list_groups" => Command::ListGroups,
            "regenerate_group_key" => Command::RegenerateGroupKey(body_json(body)?),

            "list_root" => Command::ListRoot(body_json(body)?),
            "list_folder" => Command::ListFolder(body_json(body)?),
            "create_folder" => Command::CreateFolder(body_json(body)?),
            "move_entry" => Command::MoveEntry(body_json(body)?),
            "copy_entry" => Command::CopyEntry(body_json(body)?),
            "delete_entry" => Command::DeleteEntry(body_json(body)?),

            "upload_file" => Command::UploadFile(body_json(body)?),
            "upload_folder" => Command::UploadFolder(body_json(body)?),
            "download_file" => Command::DownloadFile(body_json(body)?),
            "download_folder" => Command::DownloadFolder(body_json(body)?),
            "pause_transfer" => Command::PauseTransfer(body_json(body)?),
            "resume_transfer" => Command::ResumeTransfer(body_json(body)?),
            "cancel_transfer" => Command::CancelTransfer(body_json(body)?),
            "restart_transfer" => Command::RestartTransfer(body_json(body)?),
            "list_transfers" => Command::ListTransfers,
            "clear_finished" => Command::ClearFinished,

            "add_task" => Command::AddTask(body_json(body)?),
            "update_task" => Command::UpdateTask(body_json(body)?),
            "remove_task" => Command::RemoveTask(body_json(body)?),
            "list_tasks" => Command::ListTasks,
            "enable_task" => Command::EnableTask(body_json(body)?),
            "disable_task" => Command::DisableTask(body_json(body)?),
            "run_task" => Command::RunTask(body_json(body)?),

            "query_logs" => Command::QueryLogs(body_json(body)?),
            "get_config" => Command::GetConfig,
            "update_config" => Command::UpdateConfig(body_json(body)?),
            "start_service" => Command::StartService,
            "stop_service" => Command::StopService,

            other => return Err(EngineError::NotFound(format!("command {other}"))),
        })
    }

    /// Canonical command name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddTenant(_) => "add_tenant",
            Command::UpdateTenant(_) => "update_tenant",
            Command::RemoveTenant(_) => "remove_tenant",
            Command::ListTenants => "list_tenants",
            Command::RefreshQuota(_) => "refresh_quota",
            Command::AddGroup(_) => "add_group",
            Command::UpdateGroup(_) => "update_group",
            Command::RemoveGroup(_) => "remove_group",
            Command::ListGroups => "list_groups",
            Command::RegenerateGroupKey(_) => "regenerate_group_key",
            Command::ListRoot(_) => "list_root",
            Command::ListFolder(_) => "list_folder",
            Command::CreateFolder(_) => "create_folder",
            Command::MoveEntry(_) => "move_entry",
            Command::CopyEntry(_) => "copy_entry",
            Command::DeleteEntry(_) => "delete_entry",
            Command::UploadFile(_) => "upload_file",
            Command::UploadFolder(_) => "upload_folder",
            Command::DownloadFile(_) => "download_file",
            Command::DownloadFolder(_) => "download_folder",
            Command::PauseTransfer(_) => "pause_transfer",
            Command::ResumeTransfer(_) => "resume_transfer",
            Command::CancelTransfer(_) => "cancel_transfer",
            Command::RestartTransfer(_) => "restart_transfer",
            Command::ListTransfers => "list_transfers",
            Command::ClearFinished => "clear_finished",
            Command::AddTask(_) => "add_task",
            Command::UpdateTask(_) => "update_task",
            Command::RemoveTask(_) => "remove_task",
            Command::ListTasks => "list_tasks",
            Command::EnableTask(_) => "enable_task",
            Command::DisableTask(_) => "disable_task",
            Command::RunTask(_) => "run_task",
            Command::QueryLogs(_) => "query_logs",
            Command::GetConfig => "get_config",
            Command::UpdateConfig(_) => "update_config",
            Command::StartService => "start_service",
            Command::StopService => "stop_service",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_command_with_body() {
        let body = br#"{"tenant_id": "t1", "folder_token": "fldr_1"}"#;
        let command = Command::parse("list_folder", body).unwrap();
        match command {
            Command::ListFolder(params) => {
                assert_eq!(params.tenant_id, TenantId::from_string("t1"));
                assert_eq!(params.folder_token, "fldr_1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_not_found() {
        let err = Command::parse("mystery", b"{}").unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn malformed_body_is_invalid_argument() {
        let err = Command::parse("list_folder", b"{ nope").unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn extra_fields_are_rejected() {
        let body = br#"{"tenant_id": "t1", "folder_token": "f", "sneaky": true}"#;
        let err = Command::parse("list_folder", body).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
        assert!(err.to_string().contains("sneaky"));
    }

    #[test]
    fn empty_body_works_for_parameterless_commands() {
        assert!(matches!(
            Command::parse("list_tenants", b"").unwrap(),
            Command::ListTenants
        ));
        assert!(matches!(
            Command::parse("list_root", b"").unwrap(),
            Command::ListRoot(_)
        ));
        assert!(matches!(
            Command::parse("query_logs", b"").unwrap(),
            Command::QueryLogs(_)
        ));
    }

    #[test]
    fn names_round_trip() {
        let command = Command::parse("clear_finished", b"").unwrap();
        assert_eq!(command.name(), "clear_finished");
    }

    #[test]
    fn add_task_applies_defaults() {
        let body = br#"{
            "name": "photos",
            "direction": "bidirectional",
            "tenant_id": "t1",
            "remote_folder_token": "fldr",
            "local_path": "/home/me/photos",
            "schedule": "0 3 * * *"
        }"#;
        match Command::parse("add_task", body).unwrap() {
            Command::AddTask(params) => {
                assert!(params.enabled.is_none());
                assert!(params.include_globs.is_empty());
                assert_eq!(params.direction, SyncDirection::Bidirectional);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
