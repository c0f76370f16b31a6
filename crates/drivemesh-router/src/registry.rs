//! Tenant and group registry
//!
//! Owns the `tenants.json` and `groups.json` documents. Multi-document
//! operations acquire them in the global lock order (tenants before groups)
//! and never hold a lock across a network call.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use drivemesh_core::domain::{
    group::generate_api_key, EngineError, EngineResult, Group, GroupId, Tenant, TenantId,
};
use drivemesh_core::ports::TokenSink;
use drivemesh_store::Document;

/// Registry over the tenant and group documents.
pub struct TenantRegistry {
    tenants: Arc<Document<Vec<Tenant>>>,
    groups: Arc<Document<Vec<Group>>>,
}

impl TenantRegistry {
    pub fn new(tenants: Arc<Document<Vec<Tenant>>>, groups: Arc<Document<Vec<Group>>>) -> Self {
        Self { tenants, groups }
    }

    // ========================================================================
    // Tenants
    // ========================================================================

    /// Adds a tenant. When `tenant.order` is zero the next free position is
    /// assigned; a non-zero order must be unique.
    pub async fn add_tenant(&self, mut tenant: Tenant) -> EngineResult<Tenant> {
        let added = self
            .tenants
            .update(|tenants| {
                if tenants.iter().any(|t| t.id == tenant.id) {
                    return Err(EngineError::Conflict(format!(
                        "tenant {} already registered",
                        tenant.id
                    )));
                }
                if tenant.order == 0 {
                    tenant.order = tenants.iter().map(|t| t.order).max().unwrap_or(0) + 1;
                } else if tenants.iter().any(|t| t.order == tenant.order) {
                    return Err(EngineError::InvalidArgument(format!(
                        "order {} is already taken",
                        tenant.order
                    )));
                }
                tenants.push(tenant.clone());
                Ok(tenant.clone())
            })
            .await?;
        info!(tenant_id = %added.id, order = added.order, "Tenant added");
        Ok(added)
    }

    /// Applies a mutation to one tenant and persists the document.
    pub async fn update_tenant(
        &self,
        id: &TenantId,
        f: impl FnOnce(&mut Tenant),
    ) -> EngineResult<Tenant> {
        let id = id.clone();
        self.tenants
            .update(move |tenants| {
                let before_orders: Vec<u32> = tenants
                    .iter()
                    .filter(|t| t.id != id)
                    .map(|t| t.order)
                    .collect();
                let tenant = tenants
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))?;
                f(tenant);
                if before_orders.contains(&tenant.order) {
                    return Err(EngineError::InvalidArgument(format!(
                        "order {} is already taken",
                        tenant.order
                    )));
                }
                Ok(tenant.clone())
            })
            .await
    }

    /// Removes a tenant and scrubs its id from every group's membership.
    ///
    /// Takes the tenant lock, then the group lock, matching the global lock
    /// order. Cancelling the tenant's in-flight transfers is the transfer
    /// engine's part of the cascade and runs after this returns.
    pub async fn remove_tenant(&self, id: &TenantId) -> EngineResult<Tenant> {
        let removed = {
            let id = id.clone();
            self.tenants
                .update(move |tenants| {
                    let idx = tenants
                        .iter()
                        .position(|t| t.id == id)
                        .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))?;
                    Ok(tenants.remove(idx))
                })
                .await?
        };

        let id = id.clone();
        self.groups
            .update(move |groups| {
                for group in groups.iter_mut() {
                    group.tenant_ids.remove(&id);
                }
                Ok(())
            })
            .await?;

        info!(tenant_id = %removed.id, "Tenant removed and group memberships scrubbed");
        Ok(removed)
    }

    pub async fn get_tenant(&self, id: &TenantId) -> EngineResult<Tenant> {
        let id_for_err = id.clone();
        let id = id.clone();
        self.tenants
            .read(move |tenants| tenants.iter().find(|t| t.id == id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tenant {id_for_err}")))
    }

    /// All tenants in registry order.
    pub async fn list_tenants(&self) -> EngineResult<Vec<Tenant>> {
        let mut tenants = self.tenants.read(|t| t.clone()).await?;
        tenants.sort_by_key(|t| t.order);
        Ok(tenants)
    }

    /// Records a fresh quota reading on the tenant. Overruns are stored
    /// as-is; they are a monitoring signal, not an error.
    pub async fn record_quota(&self, id: &TenantId, used: u64, total: u64) -> EngineResult<Tenant> {
        self.update_tenant(id, |tenant| {
            tenant.used_bytes = used;
            tenant.quota_bytes = total;
        })
        .await
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Creates a group after checking every member tenant exists.
    pub async fn add_group(
        &self,
        name: impl Into<String>,
        remark: impl Into<String>,
        tenant_ids: BTreeSet<TenantId>,
    ) -> EngineResult<Group> {
        self.assert_tenants_exist(&tenant_ids).await?;

        let mut group = Group::new(name, remark);
        group.tenant_ids = tenant_ids;

        let created = self
            .groups
            .update(move |groups| {
                while groups.iter().any(|g| g.api_key == group.api_key) {
                    group.regenerate_key();
                }
                groups.push(group.clone());
                Ok(group)
            })
            .await?;
        info!(group_id = %created.id, members = created.tenant_ids.len(), "Group added");
        Ok(created)
    }

    /// Applies a mutation to one group; membership changes are re-validated.
    pub async fn update_group(
        &self,
        id: &GroupId,
        f: impl FnOnce(&mut Group),
    ) -> EngineResult<Group> {
        let existing_tenants: BTreeSet<TenantId> = self
            .tenants
            .read(|tenants| tenants.iter().map(|t| t.id.clone()).collect())
            .await?;

        let id = id.clone();
        self.groups
            .update(move |groups| {
                let group = groups
                    .iter_mut()
                    .find(|g| g.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
                f(group);
                if let Some(missing) =
                    group.tenant_ids.iter().find(|t| !existing_tenants.contains(t))
                {
                    return Err(EngineError::InvalidArgument(format!(
                        "group references unknown tenant {missing}"
                    )));
                }
                Ok(group.clone())
            })
            .await
    }

    pub async fn remove_group(&self, id: &GroupId) -> EngineResult<Group> {
        let id = id.clone();
        let removed = self
            .groups
            .update(move |groups| {
                let idx = groups
                    .iter()
                    .position(|g| g.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
                Ok(groups.remove(idx))
            })
            .await?;
        info!(group_id = %removed.id, "Group removed");
        Ok(removed)
    }

    pub async fn get_group(&self, id: &GroupId) -> EngineResult<Group> {
        let id_for_err = id.clone();
        let id = id.clone();
        self.groups
            .read(move |groups| groups.iter().find(|g| g.id == id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("group {id_for_err}")))
    }

    pub async fn list_groups(&self) -> EngineResult<Vec<Group>> {
        self.groups.read(|g| g.clone()).await
    }

    /// Replaces a group's API key, keeping it unique across all groups.
    pub async fn regenerate_group_key(&self, id: &GroupId) -> EngineResult<Group> {
        let id = id.clone();
        self.groups
            .update(move |groups| {
                let others: Vec<String> = groups
                    .iter()
                    .filter(|g| g.id != id)
                    .map(|g| g.api_key.clone())
                    .collect();
                let group = groups
                    .iter_mut()
                    .find(|g| g.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
                loop {
                    group.regenerate_key();
                    if !others.contains(&group.api_key) {
                        break;
                    }
                }
                Ok(group.clone())
            })
            .await
    }

    /// Resolves an API key to its group, if any.
    pub async fn resolve_api_key(&self, key: &str) -> EngineResult<Option<Group>> {
        let key = key.to_string();
        self.groups
            .read(move |groups| groups.iter().find(|g| g.api_key == key).cloned())
            .await
    }

    /// Tenants visible to a scope, in registry order. `None` means the
    /// unscoped universe (admin).
    pub async fn tenants_in_scope(&self, group: Option<&GroupId>) -> EngineResult<Vec<Tenant>> {
        let mut tenants = match group {
            None => self.tenants.read(|t| t.clone()).await?,
            Some(group_id) => {
                let members = self.get_group(group_id).await?.tenant_ids;
                self.tenants
                    .read(move |tenants| {
                        tenants
                            .iter()
                            .filter(|t| members.contains(&t.id))
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .await?
            }
        };
        tenants.sort_by_key(|t| t.order);
        Ok(tenants)
    }

    /// Persists a freshly minted access token onto the tenant record, so a
    /// restart reuses it instead of re-authenticating.
    pub async fn record_token(
        &self,
        id: &TenantId,
        access_token: &str,
        expiry: DateTime<Utc>,
    ) -> EngineResult<Tenant> {
        let access_token = access_token.to_string();
        self.update_tenant(id, |tenant| {
            tenant.cache_token(access_token, expiry);
        })
        .await
    }

    async fn assert_tenants_exist(&self, ids: &BTreeSet<TenantId>) -> EngineResult<()> {
        let ids = ids.clone();
        self.tenants
            .read(move |tenants| {
                for id in &ids {
                    if !tenants.iter().any(|t| t.id == *id) {
                        return Err(EngineError::InvalidArgument(format!(
                            "group references unknown tenant {id}"
                        )));
                    }
                }
                Ok(())
            })
            .await?
    }
}

#[async_trait::async_trait]
impl TokenSink for TenantRegistry {
    async fn store_token(
        &self,
        tenant_id: &TenantId,
        access_token: &str,
        expiry: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.record_token(tenant_id, access_token, expiry)
            .await
            .map(|_| ())
    }
}
