//! drivemesh store - document-oriented on-disk persistence
//!
//! Every persisted collection (tenants, groups, tasks, transfers, config) is
//! one JSON file in the application data directory, guarded by a per-file
//! read-write lock. Writes are atomic (write-to-temp-then-rename). A file
//! that fails to parse is fatal for that file only: the document refuses all
//! access with `PersistenceCorrupt` until the operator resolves it, while
//! every other document keeps working.
//!
//! There are no cross-file transactions. Components that mutate multiple
//! documents take them in the fixed global order
//! `config < tenants < groups < tasks < snapshots < transfers < logs`.

pub mod document;
pub mod paths;
pub mod snapshots;

pub use document::Document;
pub use paths::DataPaths;
pub use snapshots::SnapshotStore;
