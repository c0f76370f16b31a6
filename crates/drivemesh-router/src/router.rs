//! Federated namespace routing
//!
//! The router answers questions that span tenants: what does the combined
//! root look like, which tenant should host a new write, and is a name free
//! under a parent folder. It consumes the backend port and the registry;
//! it holds no state of its own.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use drivemesh_core::domain::{
    EngineError, EngineResult, GroupId, Tenant, TenantId, WriteDenyReason,
};
use drivemesh_core::ports::{DriveBackend, EntryKind, RemoteEntry};

use crate::registry::TenantRegistry;

/// Minimum free capacity a write target must have: 1 MiB.
pub const CAPACITY_EPSILON: u64 = 1024 * 1024;

/// One tenant's slice of the federated root listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FederatedRoot {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub root_token: String,
    pub entries: Vec<RemoteEntry>,
}

/// Namespace router over the tenant federation.
pub struct DriveRouter {
    registry: Arc<TenantRegistry>,
    backend: Arc<dyn DriveBackend>,
    /// Bounded fan-out for federated listings.
    list_concurrency: usize,
}

impl DriveRouter {
    pub fn new(
        registry: Arc<TenantRegistry>,
        backend: Arc<dyn DriveBackend>,
        list_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            backend,
            list_concurrency: list_concurrency.clamp(1, 5),
        }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn DriveBackend> {
        &self.backend
    }

    // ========================================================================
    // Aggregated root
    // ========================================================================

    /// Lists the root of every active tenant in scope, in registry order.
    ///
    /// Listings run in parallel with bounded concurrency. A tenant whose
    /// listing fails is skipped with a warning so one unreachable drive does
    /// not blank the whole federation; if every tenant fails, the first
    /// error is returned.
    pub async fn aggregated_root(
        &self,
        group: Option<&GroupId>,
    ) -> EngineResult<Vec<FederatedRoot>> {
        let tenants: Vec<Tenant> = self
            .registry
            .tenants_in_scope(group)
            .await?
            .into_iter()
            .filter(|t| t.active)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.list_concurrency));
        let mut join_set = JoinSet::new();

        for tenant in tenants.iter().cloned() {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let result = backend.list_root(&tenant).await;
                (tenant, result)
            });
        }

        let mut slices = Vec::new();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            let (tenant, result) = joined.map_err(|e| {
                EngineError::LocalIo(format!("federated listing task failed: {e}"))
            })?;
            match result {
                Ok((root_token, entries)) => slices.push(FederatedRoot {
                    tenant_id: tenant.id,
                    tenant_name: tenant.display_name,
                    root_token,
                    entries,
                }),
                Err(err) => {
                    warn!(tenant_id = %tenant.id, error = %err, "Tenant root listing failed, skipping");
                    first_error.get_or_insert(err);
                }
            }
        }

        if slices.is_empty() {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        // Join order is completion order; restore registry order.
        let order_of = |id: &TenantId| tenants.iter().position(|t| &t.id == id).unwrap_or(usize::MAX);
        slices.sort_by_key(|s| order_of(&s.tenant_id));
        Ok(slices)
    }

    // ========================================================================
    // Write-target selection
    // ========================================================================

    /// Picks the tenant that should host a write of `size_hint` bytes and
    /// resolves its root token.
    ///
    /// Tenants are tried in ascending registry order; inactive and read-only
    /// tenants are skipped, as is any tenant whose free capacity does not
    /// clear `max(size_hint, ε)`.
    pub async fn select_write_target(
        &self,
        group: Option<&GroupId>,
        size_hint: u64,
    ) -> EngineResult<(Tenant, String)> {
        let tenants = self.registry.tenants_in_scope(group).await?;
        if tenants.is_empty() {
            return Err(EngineError::NoWritableTenant {
                reason: WriteDenyReason::Permission,
            });
        }

        let required = size_hint.max(CAPACITY_EPSILON);
        let mut saw_writable = false;

        for tenant in tenants {
            if !tenant.is_writable() {
                continue;
            }
            saw_writable = true;
            if tenant.free_bytes() > required {
                debug!(
                    tenant_id = %tenant.id,
                    free = tenant.free_bytes(),
                    required,
                    "Write target selected"
                );
                let (root_token, _) = self.backend.list_root(&tenant).await?;
                return Ok((tenant, root_token));
            }
        }

        Err(EngineError::NoWritableTenant {
            reason: if saw_writable {
                WriteDenyReason::Capacity
            } else {
                WriteDenyReason::Permission
            },
        })
    }

    // ========================================================================
    // Name uniqueness
    // ========================================================================

    /// Asserts that `name` is free under `parent_token`.
    ///
    /// A listing that itself contains duplicate live names is surfaced as
    /// `PersistenceCorrupt` rather than silently picking one entry.
    pub async fn ensure_unique_name(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<()> {
        let entries = self.backend.list_folder(tenant, parent_token).await?;
        assert_no_duplicate_names(parent_token, &entries)?;
        if entries.iter().any(|e| e.name == name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Creates a folder after the uniqueness check.
    pub async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        self.ensure_unique_name(tenant, parent_token, name).await?;
        self.backend.create_folder(tenant, parent_token, name).await
    }

    /// Moves an entry after checking its name is free at the destination.
    pub async fn move_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
    ) -> EngineResult<()> {
        let entries = self.backend.list_folder(tenant, new_parent).await?;
        assert_no_duplicate_names(new_parent, &entries)?;
        if let Some(moving) = self.find_entry(tenant, token).await? {
            if entries.iter().any(|e| e.name == moving.name && e.token != token) {
                return Err(EngineError::DuplicateName(moving.name));
            }
        }
        self.backend.move_entry(tenant, token, new_parent).await
    }

    /// Copies an entry under a new name after the uniqueness check.
    pub async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String> {
        self.ensure_unique_name(tenant, new_parent, new_name).await?;
        self.backend
            .copy_entry(tenant, token, new_parent, new_name)
            .await
    }

    pub async fn delete_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        kind: EntryKind,
    ) -> EngineResult<()> {
        self.backend.delete_entry(tenant, token, kind).await
    }

    /// Re-queries the backend quota and records it on the tenant.
    pub async fn refresh_quota(&self, tenant_id: &TenantId) -> EngineResult<Tenant> {
        let tenant = self.registry.get_tenant(tenant_id).await?;
        let quota = self.backend.quota(&tenant).await?;
        if quota.used > quota.total {
            warn!(tenant_id = %tenant.id, used = quota.used, total = quota.total, "Tenant is over quota");
        }
        self.registry
            .record_quota(tenant_id, quota.used, quota.total)
            .await
    }

    /// Finds an entry by token in its parent listing, best effort: the
    /// backend has no reverse lookup, so this walks the root level only when
    /// the parent is unknown.
    async fn find_entry(&self, tenant: &Tenant, token: &str) -> EngineResult<Option<RemoteEntry>> {
        let (_, entries) = self.backend.list_root(tenant).await?;
        let mut stack: Vec<RemoteEntry> = entries;
        let mut visited = 0usize;
        while let Some(entry) = stack.pop() {
            if entry.token == token {
                return Ok(Some(entry));
            }
            if entry.kind.is_folder() && visited < 1000 {
                visited += 1;
                stack.extend(self.backend.list_folder(tenant, &entry.token).await?);
            }
        }
        Ok(None)
    }
}

/// Fails with `PersistenceCorrupt` when a listing holds two live entries
/// sharing one name.
fn assert_no_duplicate_names(parent_token: &str, entries: &[RemoteEntry]) -> EngineResult<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(EngineError::PersistenceCorrupt(format!(
                "folder {parent_token} holds two entries named '{}'",
                entry.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivemesh_backend::MemoryBackend;
    use drivemesh_core::domain::{AppCredentials, Permission, Platform};
    use drivemesh_store::Document;

    async fn setup(dir: &std::path::Path) -> (Arc<TenantRegistry>, Arc<MemoryBackend>, DriveRouter)
    {
        let tenants = Arc::new(Document::open(dir.join("tenants.json")).await.unwrap());
        let groups = Arc::new(Document::open(dir.join("groups.json")).await.unwrap());
        let registry = Arc::new(TenantRegistry::new(tenants, groups));
        let backend = Arc::new(MemoryBackend::new());
        let router = DriveRouter::new(
            Arc::clone(&registry),
            backend.clone() as Arc<dyn DriveBackend>,
            5,
        );
        (registry, backend, router)
    }

    fn tenant(name: &str, order: u32) -> Tenant {
        Tenant::new(
            name,
            AppCredentials {
                app_id: "a".into(),
                app_secret: "s".into(),
            },
            Platform::Intl,
            order,
        )
    }

    #[tokio::test]
    async fn aggregated_root_follows_registry_order() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, router) = setup(dir.path()).await;

        let b = registry.add_tenant(tenant("beta", 2)).await.unwrap();
        let a = registry.add_tenant(tenant("alpha", 1)).await.unwrap();
        backend
            .seed_file(&a, "root", "a.txt", b"a".to_vec(), chrono::Utc::now())
            .await;
        backend
            .seed_file(&b, "root", "b.txt", b"b".to_vec(), chrono::Utc::now())
            .await;

        let slices = router.aggregated_root(None).await.unwrap();
        let names: Vec<&str> = slices.iter().map(|s| s.tenant_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(slices[0].entries[0].name, "a.txt");
    }

    #[tokio::test]
    async fn aggregated_root_skips_inactive_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _backend, router) = setup(dir.path()).await;

        let mut t = tenant("sleeper", 1);
        t.active = false;
        registry.add_tenant(t).await.unwrap();
        registry.add_tenant(tenant("awake", 2)).await.unwrap();

        let slices = router.aggregated_root(None).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].tenant_name, "awake");
    }

    #[tokio::test]
    async fn write_target_picks_first_with_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _backend, router) = setup(dir.path()).await;

        let gib = 1024 * 1024 * 1024u64;
        let mut a = tenant("a", 1);
        a.quota_bytes = 100 * gib;
        a.used_bytes = 100 * gib - gib / 10; // 0.1 GiB free
        let mut b = tenant("b", 2);
        b.quota_bytes = 100 * gib;
        b.used_bytes = 10 * gib;
        registry.add_tenant(a).await.unwrap();
        let b = registry.add_tenant(b).await.unwrap();

        // A 2 GiB upload skips the nearly full tenant.
        let (target, root) = router
            .select_write_target(None, 2 * gib)
            .await
            .unwrap();
        assert_eq!(target.id, b.id);
        assert_eq!(root, "root");
    }

    #[tokio::test]
    async fn write_target_distinguishes_permission_from_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _backend, router) = setup(dir.path()).await;

        let mut ro = tenant("ro", 1);
        ro.permission = Permission::ReadOnly;
        ro.quota_bytes = 1 << 40;
        registry.add_tenant(ro).await.unwrap();

        let err = router.select_write_target(None, 0).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::NoWritableTenant {
                reason: WriteDenyReason::Permission
            }
        );

        let mut full = tenant("full", 2);
        full.quota_bytes = 100;
        full.used_bytes = 100;
        registry.add_tenant(full).await.unwrap();

        let err = router.select_write_target(None, 0).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::NoWritableTenant {
                reason: WriteDenyReason::Capacity
            }
        );
    }

    #[tokio::test]
    async fn epsilon_alone_gates_small_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _backend, router) = setup(dir.path()).await;

        let mut t = tenant("thin", 1);
        t.quota_bytes = CAPACITY_EPSILON; // free == ε, not strictly greater
        registry.add_tenant(t).await.unwrap();

        let err = router.select_write_target(None, 0).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::NoWritableTenant {
                reason: WriteDenyReason::Capacity
            }
        );
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_before_create() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, router) = setup(dir.path()).await;
        let t = registry.add_tenant(tenant("t", 1)).await.unwrap();
        backend
            .seed_file(&t, "root", "taken.txt", b"x".to_vec(), chrono::Utc::now())
            .await;

        let err = router
            .ensure_unique_name(&t, "root", "taken.txt")
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateName("taken.txt".into()));

        assert!(router.ensure_unique_name(&t, "root", "free.txt").await.is_ok());
        let token = router.create_folder(&t, "root", "free.txt").await.unwrap();
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn upstream_duplicates_surface_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, router) = setup(dir.path()).await;
        let t = registry.add_tenant(tenant("t", 1)).await.unwrap();
        backend
            .seed_file(&t, "root", "twin.txt", b"1".to_vec(), chrono::Utc::now())
            .await;
        backend
            .seed_file(&t, "root", "twin.txt", b"2".to_vec(), chrono::Utc::now())
            .await;

        let err = router
            .ensure_unique_name(&t, "root", "other.txt")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PersistenceCorrupt");
    }

    #[tokio::test]
    async fn refresh_quota_records_backend_reading() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, router) = setup(dir.path()).await;
        let t = registry.add_tenant(tenant("t", 1)).await.unwrap();
        backend.set_quota(&t, 123, 456).await;

        let updated = router.refresh_quota(&t.id).await.unwrap();
        assert_eq!(updated.used_bytes, 123);
        assert_eq!(updated.quota_bytes, 456);
    }
}
