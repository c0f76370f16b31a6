//! Transfer entity and its state machine
//!
//! A transfer is one durable upload or download record. The engine
//! reconstructs its queue from these records on startup, so every field a
//! worker needs to continue after a crash lives here, most importantly the
//! [`ResumePayload`] checkpoint.
//!
//! State machine: `pending → running ⇄ paused → {success, failed}`.
//! Terminal states freeze `transferred` and drop no further events.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{EngineError, EngineResult};
use super::ids::{TaskId, TenantId, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    FileUp,
    FolderUp,
    FileDown,
    FolderDown,
}

impl TransferKind {
    pub fn direction(&self) -> TransferDirection {
        match self {
            TransferKind::FileUp | TransferKind::FolderUp => TransferDirection::Upload,
            TransferKind::FileDown | TransferKind::FolderDown => TransferDirection::Download,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, TransferKind::FolderUp | TransferKind::FolderDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::Failed)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Running => "running",
            TransferStatus::Paused => "paused",
            TransferStatus::Success => "success",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Durable checkpoint allowing a partially completed transfer to continue
/// after pause, failure, or process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumePayload {
    Upload {
        upload_id: String,
        block_size: u64,
        /// Next block sequence number to send (all blocks `< next_seq` are
        /// durable upstream).
        next_seq: u64,
        parent_token: String,
        file_path: PathBuf,
        file_name: String,
        size: u64,
    },
    Download {
        temp_path: PathBuf,
        target_path: PathBuf,
        /// Bytes already appended to the temp file.
        downloaded: u64,
        token: String,
        file_name: String,
    },
}

/// One durable upload or download record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub kind: TransferKind,
    /// Display name (file or folder name).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Sync task that created this transfer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Enclosing folder transfer, for per-file children of folder jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TransferId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<ResumePayload>,
}

impl Transfer {
    pub fn new(kind: TransferKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            direction: kind.direction(),
            kind,
            name: name.into(),
            tenant_id: None,
            parent_token: None,
            resource_token: None,
            local_path: None,
            remote_path: None,
            size: 0,
            transferred: 0,
            status: TransferStatus::Pending,
            message: None,
            task_id: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
            resume_payload: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: TransferStatus) -> EngineResult<()> {
        use TransferStatus::*;
        let ok = matches!(
            (self.status, to),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Success)
                | (Pending, Failed)
                | (Running, Failed)
                | (Paused, Failed)
                | (Pending, Paused)
        );
        if !ok {
            return Err(EngineError::Conflict(format!(
                "transfer {} cannot go from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    pub fn begin_running(&mut self) -> EngineResult<()> {
        self.transition(TransferStatus::Running)
    }

    /// Pause between blocks; also used at startup to demote interrupted work.
    pub fn mark_paused(&mut self) -> EngineResult<()> {
        self.transition(TransferStatus::Paused)
    }

    pub fn mark_success(&mut self) -> EngineResult<()> {
        self.transition(TransferStatus::Success)?;
        self.resume_payload = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> EngineResult<()> {
        self.transition(TransferStatus::Failed)?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Records block/chunk progress. `transferred` never exceeds `size` for
    /// sized transfers.
    pub fn record_progress(&mut self, bytes: u64) {
        self.transferred = if self.size > 0 {
            (self.transferred + bytes).min(self.size)
        } else {
            self.transferred + bytes
        };
        self.touch();
    }

    /// Builds a fresh pending record with the same logical parameters,
    /// used by `restart` after a failure.
    pub fn restarted(&self) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            direction: self.direction,
            kind: self.kind,
            name: self.name.clone(),
            tenant_id: self.tenant_id.clone(),
            parent_token: self.parent_token.clone(),
            resource_token: self.resource_token.clone(),
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            size: self.size,
            transferred: 0,
            status: TransferStatus::Pending,
            message: None,
            task_id: self.task_id.clone(),
            parent_id: None,
            created_at: now,
            updated_at: now,
            resume_payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> Transfer {
        let mut t = Transfer::new(TransferKind::FileUp, "report.pdf");
        t.size = 1000;
        t
    }

    #[test]
    fn kind_implies_direction() {
        assert_eq!(TransferKind::FileUp.direction(), TransferDirection::Upload);
        assert_eq!(
            TransferKind::FolderDown.direction(),
            TransferDirection::Download
        );
        assert!(TransferKind::FolderUp.is_folder());
        assert!(!TransferKind::FileDown.is_folder());
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = upload();
        t.begin_running().unwrap();
        t.mark_paused().unwrap();
        t.begin_running().unwrap();
        t.mark_success().unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_frozen() {
        let mut t = upload();
        t.begin_running().unwrap();
        t.mark_success().unwrap();
        assert!(t.begin_running().is_err());
        assert!(t.mark_paused().is_err());
        assert!(t.mark_failed("nope").is_err());
    }

    #[test]
    fn cannot_resume_a_pending_transfer_into_success() {
        let mut t = upload();
        assert!(t.mark_success().is_err());
    }

    #[test]
    fn failure_allowed_from_any_live_state() {
        let mut t = upload();
        t.mark_failed("tenant removed").unwrap();
        assert_eq!(t.status, TransferStatus::Failed);
        assert_eq!(t.message.as_deref(), Some("tenant removed"));

        let mut t = upload();
        t.begin_running().unwrap();
        t.mark_paused().unwrap();
        t.mark_failed("cancelled").unwrap();
    }

    #[test]
    fn progress_is_clamped_to_size() {
        let mut t = upload();
        t.record_progress(600);
        t.record_progress(600);
        assert_eq!(t.transferred, 1000);
    }

    #[test]
    fn unsized_progress_accumulates_freely() {
        let mut t = Transfer::new(TransferKind::FileDown, "stream.bin");
        t.record_progress(300);
        t.record_progress(300);
        assert_eq!(t.transferred, 600);
    }

    #[test]
    fn success_clears_resume_payload() {
        let mut t = upload();
        t.resume_payload = Some(ResumePayload::Upload {
            upload_id: "u1".into(),
            block_size: 512,
            next_seq: 1,
            parent_token: "p".into(),
            file_path: PathBuf::from("/tmp/report.pdf"),
            file_name: "report.pdf".into(),
            size: 1000,
        });
        t.begin_running().unwrap();
        t.mark_success().unwrap();
        assert!(t.resume_payload.is_none());
    }

    #[test]
    fn restarted_copy_is_fresh() {
        let mut t = upload();
        t.begin_running().unwrap();
        t.record_progress(500);
        t.mark_failed("network").unwrap();

        let fresh = t.restarted();
        assert_ne!(fresh.id, t.id);
        assert_eq!(fresh.status, TransferStatus::Pending);
        assert_eq!(fresh.transferred, 0);
        assert_eq!(fresh.name, t.name);
        assert_eq!(fresh.size, t.size);
        assert!(fresh.message.is_none());
    }

    #[test]
    fn resume_payload_roundtrip() {
        let payload = ResumePayload::Download {
            temp_path: PathBuf::from("/dl/file.bin.part"),
            target_path: PathBuf::from("/dl/file.bin"),
            downloaded: 2048,
            token: "tok".into(),
            file_name: "file.bin".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"download\""));
        let back: ResumePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, back);
    }
}
