//! drivemesh backend - DriveBackend adapters
//!
//! Two implementations of the [`DriveBackend`](drivemesh_core::ports::DriveBackend)
//! port live here:
//!
//! - [`http::HttpDriveBackend`] talks to the upstream drive's REST API with a
//!   typed `reqwest` client, per-tenant token refresh, and per-tenant rate
//!   limiting.
//! - [`memory::MemoryBackend`] keeps a whole drive namespace in process
//!   memory with faithful upload-session and short-read semantics. It backs
//!   the engine's tests and offline development.

pub mod auth;
pub mod http;
pub mod memory;

pub use http::HttpDriveBackend;
pub use memory::MemoryBackend;
