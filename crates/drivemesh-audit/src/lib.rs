//! drivemesh audit - append-only API log with bounded retention
//!
//! One active `api.jsonl` file receives one JSON line per gateway request.
//! When the active file reaches the configured cap it rolls over to a
//! timestamped archive; archives are pruned oldest-first so the directory
//! stays under the cap. Reads support command-substring and status filters
//! with a limit, newest first.
//!
//! Audit writes are expected to be wrapped non-fatally by callers: a failed
//! append must never fail the request that triggered it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use drivemesh_core::config::{AUDIT_CAP_MAX_MB, AUDIT_CAP_MIN_MB};
use drivemesh_core::domain::{ApiCallStatus, ApiLogEntry, EngineError, EngineResult};

/// Active log file name; archives are `api-<timestamp>.jsonl`.
const ACTIVE_FILE: &str = "api.jsonl";

/// Rolling, size-capped audit log.
pub struct ApiAuditLog {
    dir: PathBuf,
    cap_bytes: u64,
    write_lock: Mutex<()>,
}

impl ApiAuditLog {
    /// Creates a log in `dir` with the cap clamped to the supported range
    /// (5–2048 MB).
    pub fn new(dir: impl Into<PathBuf>, max_size_mb: u64) -> Self {
        let clamped = max_size_mb.clamp(AUDIT_CAP_MIN_MB, AUDIT_CAP_MAX_MB);
        Self {
            dir: dir.into(),
            cap_bytes: clamped * 1024 * 1024,
            write_lock: Mutex::new(()),
        }
    }

    /// Test hook: an explicit byte cap without the MB clamp.
    #[doc(hidden)]
    pub fn with_cap_bytes(dir: impl Into<PathBuf>, cap_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            cap_bytes,
            write_lock: Mutex::new(()),
        }
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    /// Appends one entry, rolling the active file over first when it has
    /// reached the cap.
    pub async fn append(&self, entry: &ApiLogEntry) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let active = self.active_path();
        let active_len = tokio::fs::metadata(&active).await.map(|m| m.len()).unwrap_or(0);
        if active_len >= self.cap_bytes {
            self.roll_over(&active).await?;
        }

        let mut line = serde_json::to_vec(entry)
            .map_err(|e| EngineError::LocalIo(format!("serialize audit entry: {e}")))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&active)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn roll_over(&self, active: &Path) -> EngineResult<()> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let archive = self.dir.join(format!("api-{stamp}.jsonl"));
        tokio::fs::rename(active, &archive).await?;
        info!(archive = %archive.display(), "Audit log rolled over");
        self.prune_archives().await
    }

    /// Drops the oldest archives until their total size fits the cap.
    async fn prune_archives(&self) -> EngineResult<()> {
        let mut archives = self.archive_paths().await?;
        // Names embed the timestamp, so lexical order is age order.
        archives.sort();

        let mut sizes = Vec::with_capacity(archives.len());
        let mut total = 0u64;
        for path in &archives {
            let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            sizes.push(len);
            total += len;
        }

        let mut idx = 0;
        while total > self.cap_bytes && idx < archives.len() {
            debug!(path = %archives[idx].display(), "Pruning oldest audit archive");
            if let Err(err) = tokio::fs::remove_file(&archives[idx]).await {
                warn!(error = %err, "Failed to prune audit archive");
            }
            total -= sizes[idx];
            idx += 1;
        }
        Ok(())
    }

    async fn archive_paths(&self) -> EngineResult<Vec<PathBuf>> {
        let mut archives = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(archives),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("api-") && name.ends_with(".jsonl") {
                archives.push(entry.path());
            }
        }
        Ok(archives)
    }

    /// Filtered read, newest entries first.
    pub async fn query(
        &self,
        command_contains: Option<&str>,
        status: Option<ApiCallStatus>,
        limit: usize,
    ) -> EngineResult<Vec<ApiLogEntry>> {
        let mut files = self.archive_paths().await?;
        files.sort();
        files.push(self.active_path());

        let mut entries: Vec<ApiLogEntry> = Vec::new();
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ApiLogEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        // One mangled line must not hide the rest.
                        warn!(error = %err, "Skipping unparseable audit line");
                    }
                }
            }
        }

        entries.retain(|e| {
            command_contains.map_or(true, |needle| e.command.contains(needle))
                && status.map_or(true, |s| e.status == s)
        });
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str, status: ApiCallStatus) -> ApiLogEntry {
        ApiLogEntry::new("admin", command, status, 5)
    }

    #[tokio::test]
    async fn append_then_query_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ApiAuditLog::new(dir.path().join("api_logs"), 64);

        log.append(&entry("add_tenant", ApiCallStatus::Success))
            .await
            .unwrap();
        log.append(&entry("list_tenants", ApiCallStatus::Success))
            .await
            .unwrap();

        let all = log.query(None, None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn filters_apply_substring_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let log = ApiAuditLog::new(dir.path().join("api_logs"), 64);

        log.append(&entry("add_tenant", ApiCallStatus::Success))
            .await
            .unwrap();
        log.append(&entry("remove_tenant", ApiCallStatus::Error))
            .await
            .unwrap();
        log.append(&entry("list_groups", ApiCallStatus::Success))
            .await
            .unwrap();

        let tenants = log.query(Some("tenant"), None, 100).await.unwrap();
        assert_eq!(tenants.len(), 2);

        let errors = log
            .query(None, Some(ApiCallStatus::Error), 100)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].command, "remove_tenant");

        let both = log
            .query(Some("tenant"), Some(ApiCallStatus::Success), 100)
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].command, "add_tenant");
    }

    #[tokio::test]
    async fn limit_keeps_newest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = ApiAuditLog::new(dir.path().join("api_logs"), 64);

        for i in 0..5i64 {
            let mut e = entry(&format!("cmd_{i}"), ApiCallStatus::Success);
            e.timestamp = Utc::now() + chrono::Duration::seconds(i);
            log.append(&e).await.unwrap();
        }

        let newest = log.query(None, None, 2).await.unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].command, "cmd_4");
        assert_eq!(newest[1].command, "cmd_3");
    }

    #[tokio::test]
    async fn rollover_archives_and_keeps_entries_readable() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny cap so a few entries force a roll.
        let log = ApiAuditLog::with_cap_bytes(dir.path().join("api_logs"), 400);

        for i in 0..10 {
            log.append(&entry(&format!("cmd_{i}"), ApiCallStatus::Success))
                .await
                .unwrap();
        }

        let archives = log.archive_paths().await.unwrap();
        assert!(!archives.is_empty(), "cap should have forced a rollover");

        // Entries across active + archives remain queryable.
        let all = log.query(None, None, 100).await.unwrap();
        assert!(all.len() > 1);
    }

    #[tokio::test]
    async fn pruning_removes_oldest_archives_first() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("api_logs");
        tokio::fs::create_dir_all(&logs_dir).await.unwrap();

        // Three fat archives, 300 bytes each, against a 500-byte cap.
        for stamp in ["20240101T000000000", "20240102T000000000", "20240103T000000000"] {
            tokio::fs::write(
                logs_dir.join(format!("api-{stamp}.jsonl")),
                vec![b'x'; 300],
            )
            .await
            .unwrap();
        }

        let log = ApiAuditLog::with_cap_bytes(&logs_dir, 500);
        log.prune_archives().await.unwrap();

        let mut remaining = log.archive_paths().await.unwrap();
        remaining.sort();
        let names: Vec<String> = remaining
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["api-20240103T000000000.jsonl"]);
    }

    #[tokio::test]
    async fn mangled_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("api_logs");
        let log = ApiAuditLog::new(&logs_dir, 64);

        log.append(&entry("good", ApiCallStatus::Success)).await.unwrap();
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(logs_dir.join(ACTIVE_FILE))
            .await
            .unwrap();
        file.write_all(b"{ not json\n").await.unwrap();
        file.flush().await.unwrap();
        log.append(&entry("also-good", ApiCallStatus::Success))
            .await
            .unwrap();

        let all = log.query(None, None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
