//! drivemesh sync - scheduled folder reconciliation
//!
//! The runner reconciles one remote folder against one local directory using
//! a three-way diff (remote, local, last snapshot), executes the resulting
//! plan through the transfer engine, and commits a fresh snapshot only when
//! every action succeeded.
//!
//! Module split:
//! - [`filter`] - include/exclude glob filtering
//! - [`enumerate`] - depth-first remote and local tree enumeration
//! - [`diff`] - change detection and the presence/change truth table
//! - [`runner`] - plan execution and snapshot bookkeeping

pub mod diff;
pub mod enumerate;
pub mod filter;
pub mod runner;

pub use filter::GlobFilter;
pub use runner::{RunSummary, SyncRunner};
