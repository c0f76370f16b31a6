//! Drive backend port (driven/secondary port)
//!
//! This is the abstract boundary to an upstream cloud drive. The engine and
//! the router consume this trait only; the HTTP adapter and the in-memory
//! adapter in `drivemesh-backend` implement it. Each implementation owns its
//! own token refresh and rate-limit handling, and maps upstream failures to
//! the typed [`EngineError`](crate::domain::EngineError) kinds.
//!
//! ## Idempotence contracts
//!
//! - `upload_block` is idempotent on `(upload_id, seq)`: re-sending a block
//!   the server already holds must succeed without corrupting the session.
//! - `download_range` may return short reads; callers loop until they hold
//!   `len` bytes or see EOF (an empty chunk).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineResult;
use crate::domain::tenant::Tenant;

/// Kind of a remote namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File,
    /// Cloud-native document (exportable but not byte-addressable).
    Doc,
    #[serde(other)]
    Other,
}

impl EntryKind {
    pub fn is_folder(&self) -> bool {
        matches!(self, EntryKind::Folder)
    }
}

/// One entry in a remote folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Opaque backend identifier.
    pub token: String,
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

/// Metadata for a single remote entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_modify_time: Option<DateTime<Utc>>,
}

/// Quota snapshot for one tenant's drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveQuota {
    pub used: u64,
    pub total: u64,
}

/// Handle for a chunked upload in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    /// Server-chosen block size in bytes; every block except the last must
    /// be exactly this long.
    pub block_size: u64,
}

/// Abstract remote-drive capability.
///
/// All calls take the [`Tenant`] so the adapter can pick credentials, the
/// platform endpoint, and the cached access token.
#[async_trait::async_trait]
pub trait DriveBackend: Send + Sync {
    /// Returns the root folder token and its immediate entries.
    async fn list_root(&self, tenant: &Tenant) -> EngineResult<(String, Vec<RemoteEntry>)>;

    /// Lists the immediate entries of a folder.
    async fn list_folder(&self, tenant: &Tenant, folder_token: &str)
        -> EngineResult<Vec<RemoteEntry>>;

    /// Fetches metadata for a file or folder.
    async fn metadata(&self, tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata>;

    /// Creates a folder and returns its token.
    async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String>;

    /// Moves an entry under a new parent within the same tenant.
    async fn move_entry(&self, tenant: &Tenant, token: &str, new_parent: &str)
        -> EngineResult<()>;

    /// Copies an entry under a new parent, returning the copy's token.
    async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String>;

    /// Deletes an entry. `kind` disambiguates folder vs file deletion where
    /// the upstream API distinguishes them.
    async fn delete_entry(&self, tenant: &Tenant, token: &str, kind: EntryKind)
        -> EngineResult<()>;

    /// Opens a chunked upload session.
    async fn upload_init(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        size: u64,
    ) -> EngineResult<UploadSession>;

    /// Uploads one block. Idempotent on `(upload_id, seq)`.
    async fn upload_block(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()>;

    /// Completes an upload session, returning the new file's token.
    async fn upload_finish(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<String>;

    /// Best-effort abort of an upload session.
    async fn upload_abort(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<()>;

    /// Reads up to `len` bytes starting at `offset`. May return fewer bytes
    /// than requested; an empty result signals EOF.
    async fn download_range(
        &self,
        tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>>;

    /// Current quota for the tenant's drive.
    async fn quota(&self, tenant: &Tenant) -> EngineResult<DriveQuota>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_classification() {
        assert!(EntryKind::Folder.is_folder());
        assert!(!EntryKind::File.is_folder());
        assert!(!EntryKind::Doc.is_folder());
    }

    #[test]
    fn unknown_entry_kinds_deserialize_as_other() {
        let kind: EntryKind = serde_json::from_str("\"bitable\"").unwrap();
        assert_eq!(kind, EntryKind::Other);
    }

    #[test]
    fn remote_entry_roundtrip() {
        let entry = RemoteEntry {
            token: "tok_1".into(),
            name: "notes.txt".into(),
            kind: EntryKind::File,
            parent_token: Some("tok_root".into()),
            size: Some(42),
            mtime: Some(Utc::now()),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: RemoteEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }
}
