//! Port definitions (trait seams implemented by adapter crates)

pub mod drive_backend;
pub mod token_sink;

pub use drive_backend::{
    DriveBackend, DriveQuota, EntryKind, EntryMetadata, RemoteEntry, UploadSession,
};
pub use token_sink::TokenSink;
