//! In-memory drive backend
//!
//! A complete in-process implementation of the backend contract: chunked
//! upload sessions, ranged reads with optional short-read simulation, folder
//! trees, and quota. One instance can host any number of tenants; each
//! tenant gets its own namespace on first access.

use std::collections::{BTreeMap, HashMap};

use adler2::Adler32;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use drivemesh_core::domain::{EngineError, EngineResult, Tenant};
use drivemesh_core::ports::{
    DriveBackend, DriveQuota, EntryKind, EntryMetadata, RemoteEntry, UploadSession,
};

/// Default server-chosen block size: 1 MiB.
const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default quota for a fresh drive: 10 GiB.
const DEFAULT_QUOTA_TOTAL: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: EntryKind,
    parent: Option<String>,
    content: Vec<u8>,
    mtime: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    parent_token: String,
    file_name: String,
    declared_size: u64,
    block_size: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Drive {
    nodes: HashMap<String, Node>,
    sessions: HashMap<String, Session>,
    quota_total: u64,
    used_override: Option<u64>,
    next_id: u64,
}

impl Drive {
    fn fresh() -> Self {
        let mut drive = Drive {
            quota_total: DEFAULT_QUOTA_TOTAL,
            ..Default::default()
        };
        drive.nodes.insert(
            "root".to_string(),
            Node {
                name: String::new(),
                kind: EntryKind::Folder,
                parent: None,
                content: Vec::new(),
                mtime: Utc::now(),
            },
        );
        drive
    }

    fn mint_token(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn children(&self, folder_token: &str) -> Vec<RemoteEntry> {
        let mut entries: Vec<RemoteEntry> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.as_deref() == Some(folder_token))
            .map(|(token, node)| RemoteEntry {
                token: token.clone(),
                name: node.name.clone(),
                kind: node.kind,
                parent_token: node.parent.clone(),
                size: (!node.kind.is_folder()).then_some(node.content.len() as u64),
                mtime: Some(node.mtime),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    fn used_bytes(&self) -> u64 {
        self.used_override.unwrap_or_else(|| {
            self.nodes
                .values()
                .map(|node| node.content.len() as u64)
                .sum()
        })
    }

    fn collect_subtree(&self, token: &str) -> Vec<String> {
        let mut doomed = vec![token.to_string()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            for (t, node) in &self.nodes {
                if node.parent.as_deref() == Some(parent.as_str()) {
                    doomed.push(t.clone());
                }
            }
            i += 1;
        }
        doomed
    }
}

/// In-memory [`DriveBackend`] for tests and offline runs.
pub struct MemoryBackend {
    drives: Mutex<HashMap<String, Drive>>,
    block_size: u64,
    /// When set, `download_range` returns at most this many bytes per call,
    /// exercising callers' short-read loops.
    max_read: Option<u64>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            drives: Mutex::new(HashMap::new()),
            block_size: DEFAULT_BLOCK_SIZE,
            max_read: None,
        }
    }

    /// Overrides the server-chosen upload block size.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Caps every `download_range` response at `max` bytes.
    pub fn with_short_reads(mut self, max: u64) -> Self {
        self.max_read = Some(max);
        self
    }

    async fn with_drive<R>(&self, tenant: &Tenant, f: impl FnOnce(&mut Drive) -> R) -> R {
        let mut drives = self.drives.lock().await;
        let drive = drives
            .entry(tenant.id.as_str().to_string())
            .or_insert_with(Drive::fresh);
        f(drive)
    }

    // ------------------------------------------------------------------
    // Test fixtures
    // ------------------------------------------------------------------

    /// Creates a file directly in the namespace, returning its token.
    pub async fn seed_file(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
        content: Vec<u8>,
        mtime: DateTime<Utc>,
    ) -> String {
        self.with_drive(tenant, |drive| {
            let token = drive.mint_token("tok");
            drive.nodes.insert(
                token.clone(),
                Node {
                    name: name.to_string(),
                    kind: EntryKind::File,
                    parent: Some(parent_token.to_string()),
                    content,
                    mtime,
                },
            );
            token
        })
        .await
    }

    /// Creates a folder directly in the namespace, returning its token.
    pub async fn seed_folder(&self, tenant: &Tenant, parent_token: &str, name: &str) -> String {
        self.with_drive(tenant, |drive| {
            let token = drive.mint_token("fldr");
            drive.nodes.insert(
                token.clone(),
                Node {
                    name: name.to_string(),
                    kind: EntryKind::Folder,
                    parent: Some(parent_token.to_string()),
                    content: Vec::new(),
                    mtime: Utc::now(),
                },
            );
            token
        })
        .await
    }

    /// Reads a file's bytes by token.
    pub async fn file_content(&self, tenant: &Tenant, token: &str) -> Option<Vec<u8>> {
        self.with_drive(tenant, |drive| {
            drive.nodes.get(token).map(|node| node.content.clone())
        })
        .await
    }

    /// Looks up a direct child by name.
    pub async fn child_by_name(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> Option<RemoteEntry> {
        self.with_drive(tenant, |drive| {
            drive
                .children(parent_token)
                .into_iter()
                .find(|e| e.name == name)
        })
        .await
    }

    /// Pins the reported quota instead of deriving usage from content.
    pub async fn set_quota(&self, tenant: &Tenant, used: u64, total: u64) {
        self.with_drive(tenant, |drive| {
            drive.used_override = Some(used);
            drive.quota_total = total;
        })
        .await
    }
}

#[async_trait::async_trait]
impl DriveBackend for MemoryBackend {
    async fn list_root(&self, tenant: &Tenant) -> EngineResult<(String, Vec<RemoteEntry>)> {
        Ok(self
            .with_drive(tenant, |drive| ("root".to_string(), drive.children("root")))
            .await)
    }

    async fn list_folder(
        &self,
        tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        self.with_drive(tenant, |drive| {
            match drive.nodes.get(folder_token) {
                Some(node) if node.kind.is_folder() => Ok(drive.children(folder_token)),
                Some(_) => Err(EngineError::InvalidArgument(format!(
                    "{folder_token} is not a folder"
                ))),
                None => Err(EngineError::NotFound(format!("folder {folder_token}"))),
            }
        })
        .await
    }

    async fn metadata(&self, tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata> {
        self.with_drive(tenant, |drive| {
            let node = drive
                .nodes
                .get(token)
                .ok_or_else(|| EngineError::NotFound(format!("entry {token}")))?;
            let checksum = if node.kind.is_folder() {
                None
            } else {
                let mut hasher = Adler32::new();
                hasher.write_slice(&node.content);
                Some(hasher.checksum())
            };
            Ok(EntryMetadata {
                size: node.content.len() as u64,
                mtime: node.mtime,
                checksum,
                latest_modify_time: Some(node.mtime),
            })
        })
        .await
    }

    async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        self.with_drive(tenant, |drive| {
            if !drive
                .nodes
                .get(parent_token)
                .is_some_and(|n| n.kind.is_folder())
            {
                return Err(EngineError::NotFound(format!("folder {parent_token}")));
            }
            let token = drive.mint_token("fldr");
            drive.nodes.insert(
                token.clone(),
                Node {
                    name: name.to_string(),
                    kind: EntryKind::Folder,
                    parent: Some(parent_token.to_string()),
                    content: Vec::new(),
                    mtime: Utc::now(),
                },
            );
            Ok(token)
        })
        .await
    }

    async fn move_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
    ) -> EngineResult<()> {
        self.with_drive(tenant, |drive| {
            if !drive.nodes.contains_key(new_parent) {
                return Err(EngineError::NotFound(format!("folder {new_parent}")));
            }
            let node = drive
                .nodes
                .get_mut(token)
                .ok_or_else(|| EngineError::NotFound(format!("entry {token}")))?;
            node.parent = Some(new_parent.to_string());
            node.mtime = Utc::now();
            Ok(())
        })
        .await
    }

    async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String> {
        self.with_drive(tenant, |drive| {
            if !drive.nodes.contains_key(new_parent) {
                return Err(EngineError::NotFound(format!("folder {new_parent}")));
            }
            let source = drive
                .nodes
                .get(token)
                .ok_or_else(|| EngineError::NotFound(format!("entry {token}")))?
                .clone();
            let copy_token = drive.mint_token("tok");
            drive.nodes.insert(
                copy_token.clone(),
                Node {
                    name: new_name.to_string(),
                    parent: Some(new_parent.to_string()),
                    mtime: Utc::now(),
                    ..source
                },
            );
            Ok(copy_token)
        })
        .await
    }

    async fn delete_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        _kind: EntryKind,
    ) -> EngineResult<()> {
        self.with_drive(tenant, |drive| {
            if !drive.nodes.contains_key(token) {
                return Err(EngineError::NotFound(format!("entry {token}")));
            }
            for doomed in drive.collect_subtree(token) {
                drive.nodes.remove(&doomed);
            }
            Ok(())
        })
        .await
    }

    async fn upload_init(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        size: u64,
    ) -> EngineResult<UploadSession> {
        let block_size = self.block_size;
        self.with_drive(tenant, |drive| {
            if !drive
                .nodes
                .get(parent_token)
                .is_some_and(|n| n.kind.is_folder())
            {
                return Err(EngineError::NotFound(format!("folder {parent_token}")));
            }
            let upload_id = drive.mint_token("up");
            drive.sessions.insert(
                upload_id.clone(),
                Session {
                    parent_token: parent_token.to_string(),
                    file_name: file_name.to_string(),
                    declared_size: size,
                    block_size,
                    blocks: BTreeMap::new(),
                },
            );
            Ok(UploadSession {
                upload_id,
                block_size,
            })
        })
        .await
    }

    async fn upload_block(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()> {
        self.with_drive(tenant, |drive| {
            let session = drive
                .sessions
                .get_mut(upload_id)
                .ok_or_else(|| EngineError::NotFound(format!("upload session {upload_id}")))?;
            if bytes.len() as u64 > session.block_size {
                return Err(EngineError::UpstreamPermanent(format!(
                    "block {seq} exceeds block size {}",
                    session.block_size
                )));
            }
            // Idempotent on (upload_id, seq): re-sending replaces the same slot.
            session.blocks.insert(seq, bytes);
            Ok(())
        })
        .await
    }

    async fn upload_finish(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<String> {
        self.with_drive(tenant, |drive| {
            let session = drive
                .sessions
                .remove(upload_id)
                .ok_or_else(|| EngineError::NotFound(format!("upload session {upload_id}")))?;

            let mut content = Vec::with_capacity(session.declared_size as usize);
            let mut missing = None;
            for (expected, (seq, block)) in session.blocks.iter().enumerate() {
                if *seq != expected as u64 {
                    missing = Some(expected);
                    break;
                }
                content.extend_from_slice(block);
            }
            if let Some(expected) = missing {
                drive.sessions.insert(upload_id.to_string(), session);
                return Err(EngineError::UpstreamPermanent(format!(
                    "upload {upload_id} is missing block {expected}"
                )));
            }
            if content.len() as u64 != session.declared_size {
                let got = content.len();
                let declared = session.declared_size;
                drive.sessions.insert(upload_id.to_string(), session);
                return Err(EngineError::UpstreamPermanent(format!(
                    "upload {upload_id} has {got} bytes, declared {declared}"
                )));
            }

            let token = drive.mint_token("tok");
            drive.nodes.insert(
                token.clone(),
                Node {
                    name: session.file_name,
                    kind: EntryKind::File,
                    parent: Some(session.parent_token),
                    content,
                    mtime: Utc::now(),
                },
            );
            Ok(token)
        })
        .await
    }

    async fn upload_abort(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<()> {
        self.with_drive(tenant, |drive| {
            drive.sessions.remove(upload_id);
            Ok(())
        })
        .await
    }

    async fn download_range(
        &self,
        tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>> {
        let max_read = self.max_read;
        self.with_drive(tenant, |drive| {
            let node = drive
                .nodes
                .get(token)
                .ok_or_else(|| EngineError::NotFound(format!("entry {token}")))?;
            let total = node.content.len() as u64;
            if offset >= total {
                return Ok(Vec::new());
            }
            let mut want = len.min(total - offset);
            if let Some(cap) = max_read {
                want = want.min(cap);
            }
            let start = offset as usize;
            let end = (offset + want) as usize;
            Ok(node.content[start..end].to_vec())
        })
        .await
    }

    async fn quota(&self, tenant: &Tenant) -> EngineResult<DriveQuota> {
        self.with_drive(tenant, |drive| {
            Ok(DriveQuota {
                used: drive.used_bytes(),
                total: drive.quota_total,
            })
        })
        .await
    }
}
