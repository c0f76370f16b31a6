//! Application data directory layout
//!
//! All persistent state lives under one directory with stable file names:
//!
//! ```text
//! <data_dir>/
//!   config.json
//!   tenants.json
//!   groups.json
//!   tasks.json
//!   transfers.json
//!   snapshots/<task_id>.json
//!   api_logs/<rolling>.jsonl
//! ```

use std::path::{Path, PathBuf};

/// Resolves the well-known file locations under one data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn tenants(&self) -> PathBuf {
        self.root.join("tenants.json")
    }

    pub fn groups(&self) -> PathBuf {
        self.root.join("groups.json")
    }

    pub fn tasks(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn transfers(&self) -> PathBuf {
        self.root.join("transfers.json")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn api_logs_dir(&self) -> PathBuf {
        self.root.join("api_logs")
    }
}
