//! drivemesh daemon - the resident sync engine
//!
//! Wires the document store, tenant router, transfer engine, scheduler, and
//! API gateway together, reconciles state left over from the previous run,
//! and serves until ctrl-c. All configuration lives in the document store;
//! the only flag is where that store is.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drivemesh_audit::ApiAuditLog;
use drivemesh_backend::HttpDriveBackend;
use drivemesh_core::config::EngineConfig;
use drivemesh_core::domain::{SyncTask, Transfer};
use drivemesh_core::ports::DriveBackend;
use drivemesh_gateway::{GatewayContext, GatewayServer, ServiceSwitch};
use drivemesh_router::{DriveRouter, TenantRegistry};
use drivemesh_sched::Scheduler;
use drivemesh_store::{DataPaths, Document, SnapshotStore};
use drivemesh_sync::SyncRunner;
use drivemesh_transfer::TransferEngine;

#[derive(Parser)]
#[command(name = "drivemeshd", about = "Federated cloud-drive sync daemon")]
struct Args {
    /// Application data directory holding all persistent documents.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drivemesh")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    info!(data_dir = %data_dir.display(), "drivemesh daemon starting");

    let paths = DataPaths::new(&data_dir);

    // Documents, opened in the global lock order.
    let config: Arc<Document<EngineConfig>> = Arc::new(
        Document::open(paths.config())
            .await
            .context("open config.json")?,
    );
    let generated = config
        .update(|c| Ok(c.ensure_admin_key()))
        .await
        .context("ensure admin key")?;
    if generated {
        info!("Admin API key generated; read it from config.json");
    }
    let validation = config.read(|c| c.validate()).await?;
    if !validation.is_empty() {
        for error in &validation {
            tracing::error!(%error, "Invalid configuration");
        }
        anyhow::bail!("configuration is invalid; fix config.json and restart");
    }

    let tenants = Arc::new(Document::open(paths.tenants()).await.context("open tenants.json")?);
    let groups = Arc::new(Document::open(paths.groups()).await.context("open groups.json")?);
    let tasks: Arc<Document<Vec<SyncTask>>> =
        Arc::new(Document::open(paths.tasks()).await.context("open tasks.json")?);
    let transfers_doc: Arc<Document<Vec<Transfer>>> = Arc::new(
        Document::open(paths.transfers())
            .await
            .context("open transfers.json")?,
    );
    let snapshots = Arc::new(SnapshotStore::new(paths.snapshots_dir()));

    // Components. Fresh access tokens flow back onto tenant records through
    // the registry, so restarts reuse them.
    let registry = Arc::new(TenantRegistry::new(tenants, groups));
    let backend_cfg = config.read(|c| c.backend.clone()).await?;
    let backend: Arc<dyn DriveBackend> = Arc::new(
        HttpDriveBackend::new(std::time::Duration::from_secs(backend_cfg.call_deadline_secs))
            .context("build drive backend")?
            .with_token_sink(Arc::clone(&registry) as Arc<dyn drivemesh_core::ports::TokenSink>),
    );
    let router = Arc::new(DriveRouter::new(
        Arc::clone(&registry),
        backend,
        backend_cfg.list_concurrency,
    ));

    let transfer_cfg = config.read(|c| c.transfers.clone()).await?;
    let engine = Arc::new(TransferEngine::new(
        Arc::clone(&transfers_doc),
        Arc::clone(&router),
        &transfer_cfg,
    ));

    let runner = Arc::new(SyncRunner::new(
        Arc::clone(&router),
        Arc::clone(&engine),
        Arc::clone(&snapshots),
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&tasks),
        Arc::clone(&runner) as Arc<dyn drivemesh_sched::TaskDispatcher>,
        shutdown.child_token(),
    ));

    let audit_cfg = config.read(|c| c.audit.clone()).await?;
    let audit_dir = audit_cfg.dir.unwrap_or_else(|| paths.api_logs_dir());
    let audit = Arc::new(ApiAuditLog::new(audit_dir, audit_cfg.max_size_mb));

    // Startup reconciliation: interrupted transfers park as paused, task
    // schedules are recomputed.
    engine
        .reconcile_on_startup()
        .await
        .context("reconcile transfers")?;
    scheduler
        .reconcile_on_startup()
        .await
        .context("reconcile tasks")?;

    let ctx = Arc::new(GatewayContext {
        config,
        registry,
        router,
        transfers: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
        tasks,
        snapshots,
        audit,
        service: ServiceSwitch::new(true),
    });

    let gateway = Arc::new(GatewayServer::new(Arc::clone(&ctx)));
    let gateway_task = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    info!("drivemesh daemon ready");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("Shutdown requested");

    shutdown.cancel();
    scheduler_task.await.ok();
    gateway_task.await.ok().transpose().ok();
    engine.drain().await;

    info!("drivemesh daemon stopped");
    Ok(())
}
