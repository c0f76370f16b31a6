//! drivemesh gateway - the local authenticated API surface
//!
//! A plain HTTP/1.1 server: `POST /command/<name>` with a JSON body and an
//! `X-API-Key` header. The key resolves to the admin scope or to one group;
//! scoped keys only see and act on their group's tenants. Every request is
//! timed and appended to the audit log.
//!
//! Module split:
//! - [`auth`] - API-key resolution and scope checks
//! - [`commands`] - the typed command set (unknown fields rejected)
//! - [`dispatch`] - command execution against the engine handles
//! - [`server`] - the hyper listener with admin start/stop

pub mod auth;
pub mod commands;
pub mod dispatch;
pub mod server;

use std::sync::Arc;

use tokio::sync::watch;

use drivemesh_audit::ApiAuditLog;
use drivemesh_core::config::EngineConfig;
use drivemesh_core::domain::SyncTask;
use drivemesh_router::{DriveRouter, TenantRegistry};
use drivemesh_sched::Scheduler;
use drivemesh_store::{Document, SnapshotStore};
use drivemesh_transfer::TransferEngine;

pub use server::GatewayServer;

/// Engine handles the gateway dispatches into.
///
/// Everything is an explicit `Arc` handle so tests can stand up several
/// engines side by side; there are no ambient globals.
pub struct GatewayContext {
    pub config: Arc<Document<EngineConfig>>,
    pub registry: Arc<TenantRegistry>,
    pub router: Arc<DriveRouter>,
    pub transfers: Arc<TransferEngine>,
    pub scheduler: Arc<Scheduler>,
    pub tasks: Arc<Document<Vec<SyncTask>>>,
    pub snapshots: Arc<SnapshotStore>,
    pub audit: Arc<ApiAuditLog>,
    pub service: ServiceSwitch,
}

/// Desired-state switch for the listener, flipped by the
/// `start_service`/`stop_service` admin commands.
#[derive(Clone)]
pub struct ServiceSwitch {
    desired: watch::Sender<bool>,
}

impl Default for ServiceSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ServiceSwitch {
    pub fn new(initially_running: bool) -> Self {
        let (desired, _) = watch::channel(initially_running);
        Self { desired }
    }

    pub fn set_running(&self, running: bool) {
        let _ = self.desired.send(running);
    }

    pub fn is_running(&self) -> bool {
        *self.desired.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.desired.subscribe()
    }
}
