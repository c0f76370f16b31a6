//! drivemesh core - domain model and ports
//!
//! This crate holds the pieces every other drivemesh crate agrees on:
//! - **Domain entities** - `Tenant`, `Group`, `SyncTask`, `Transfer`,
//!   `SyncSnapshot`, `ApiLogEntry`
//! - **Error taxonomy** - [`domain::errors::EngineError`] with stable kind
//!   identifiers shared by the gateway and the audit log
//! - **Port definitions** - the [`ports::drive_backend::DriveBackend`] trait
//!   that adapter crates implement
//! - **Configuration** - the persisted [`config::EngineConfig`] document
//!
//! The domain module contains pure data and state rules with no I/O. Adapter
//! crates (store, backend, gateway) depend on this crate, never the reverse.

pub mod config;
pub mod domain;
pub mod ports;
