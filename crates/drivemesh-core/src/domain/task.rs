//! Scheduled sync task entity

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, TaskId, TenantId};

/// Which way file content flows during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Remote is authoritative; only downloads and local deletes happen.
    CloudToLocal,
    /// Local is authoritative; only uploads and remote deletes happen.
    LocalToCloud,
    /// Changes propagate both ways; conflicts resolved by policy.
    Bidirectional,
}

/// How changes are detected against the last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Remote token / mtime comparison only.
    Metadata,
    /// Size difference, or mtime drift beyond the tolerance window.
    SizeMtime,
    /// `SizeMtime` plus an Adler-32 checksum over local content.
    Checksum,
}

/// How a both-sides-changed conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The side with the larger mtime wins; ties go to remote.
    Newest,
    PreferLocal,
    PreferRemote,
}

/// Lifecycle status of a task's most recent (or current) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Scheduled,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A cron-scheduled folder reconciliation between one remote folder and one
/// local directory.
///
/// `next_run_at` is recomputed on every create/update/toggle/completion and
/// whenever `enabled` flips to true. While `last_status` is `Running` the
/// scheduler never re-enters the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    pub name: String,
    pub direction: SyncDirection,
    /// Scope the task was created under; `None` for admin-created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub tenant_id: TenantId,
    pub remote_folder_token: String,
    pub local_path: PathBuf,
    /// 5-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub detection: DetectionMode,
    pub conflict: ConflictPolicy,
    pub propagate_delete: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl SyncTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        direction: SyncDirection,
        tenant_id: TenantId,
        remote_folder_token: impl Into<String>,
        local_path: PathBuf,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            direction,
            group_id: None,
            tenant_id,
            remote_folder_token: remote_folder_token.into(),
            local_path,
            schedule: schedule.into(),
            enabled: true,
            detection: DetectionMode::SizeMtime,
            conflict: ConflictPolicy::Newest,
            propagate_delete: false,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            notes: String::new(),
            next_run_at: None,
            last_run_at: None,
            last_status: TaskStatus::Idle,
            last_message: None,
            consecutive_failures: 0,
        }
    }

    /// True when the scheduler may dispatch this task at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.last_status != TaskStatus::Running
            && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Marks the task as dispatched.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        self.last_status = TaskStatus::Running;
        self.last_run_at = Some(now);
    }

    /// Records a successful run.
    pub fn finish_success(&mut self, message: impl Into<String>) {
        self.last_status = TaskStatus::Success;
        self.last_message = Some(message.into());
        self.consecutive_failures = 0;
    }

    /// Records a failed run.
    pub fn finish_failure(&mut self, message: impl Into<String>) {
        self.last_status = TaskStatus::Failed;
        self.last_message = Some(message.into());
        self.consecutive_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task() -> SyncTask {
        SyncTask::new(
            "photos",
            SyncDirection::Bidirectional,
            TenantId::from_string("t1"),
            "fldr_root",
            PathBuf::from("/home/user/Photos"),
            "0 3 * * *",
        )
    }

    #[test]
    fn new_task_is_idle_and_enabled() {
        let t = task();
        assert!(t.enabled);
        assert_eq!(t.last_status, TaskStatus::Idle);
        assert_eq!(t.consecutive_failures, 0);
        assert!(t.next_run_at.is_none());
    }

    #[test]
    fn due_requires_enabled_and_not_running() {
        let now = Utc::now();
        let mut t = task();
        t.next_run_at = Some(now - Duration::minutes(1));
        assert!(t.is_due(now));

        t.enabled = false;
        assert!(!t.is_due(now));

        t.enabled = true;
        t.last_status = TaskStatus::Running;
        assert!(!t.is_due(now));
    }

    #[test]
    fn due_requires_next_run_in_the_past() {
        let now = Utc::now();
        let mut t = task();
        t.next_run_at = Some(now + Duration::minutes(5));
        assert!(!t.is_due(now));
        t.next_run_at = None;
        assert!(!t.is_due(now));
    }

    #[test]
    fn failure_counter_accumulates_and_resets() {
        let mut t = task();
        t.finish_failure("upload failed");
        t.finish_failure("upload failed again");
        assert_eq!(t.consecutive_failures, 2);
        assert_eq!(t.last_status, TaskStatus::Failed);

        t.finish_success("12 actions");
        assert_eq!(t.consecutive_failures, 0);
        assert_eq!(t.last_status, TaskStatus::Success);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut t = task();
        t.include_globs = vec!["**/*.jpg".into()];
        t.begin_run(Utc::now());
        let json = serde_json::to_string(&t).unwrap();
        let back: SyncTask = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
