//! API-key resolution and scope enforcement

use drivemesh_core::domain::{EngineError, EngineResult, Group, GroupId, TenantId};

use crate::GatewayContext;

/// What a resolved API key is allowed to touch.
#[derive(Debug, Clone)]
pub enum Scope {
    /// The process-wide admin key: everything, including service control.
    Admin,
    /// A group key: that group's tenants only.
    Group(Group),
}

impl Scope {
    /// Label recorded in the audit log.
    pub fn label(&self) -> String {
        match self {
            Scope::Admin => "admin".to_string(),
            Scope::Group(group) => group.id.to_string(),
        }
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Scope::Admin => None,
            Scope::Group(group) => Some(&group.id),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Scope::Admin)
    }

    /// Admin-only commands fail for group keys.
    pub fn require_admin(&self, command: &str) -> EngineResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::ScopeDenied(format!(
                "{command} requires the admin key"
            )))
        }
    }

    /// Operations addressing a tenant must stay inside the key's group.
    pub fn require_tenant(&self, tenant_id: &TenantId) -> EngineResult<()> {
        match self {
            Scope::Admin => Ok(()),
            Scope::Group(group) if group.contains(tenant_id) => Ok(()),
            Scope::Group(_) => Err(EngineError::ScopeDenied(format!(
                "tenant {tenant_id} is outside this key's group"
            ))),
        }
    }

    pub fn allows_tenant(&self, tenant_id: &TenantId) -> bool {
        self.require_tenant(tenant_id).is_ok()
    }
}

/// Resolves the `X-API-Key` header value to a scope.
pub async fn resolve_scope(ctx: &GatewayContext, key: Option<&str>) -> EngineResult<Scope> {
    let key = match key {
        Some(key) if !key.is_empty() => key,
        _ => return Err(EngineError::AuthMissing),
    };

    let admin_key = ctx
        .config
        .read(|c| c.gateway.admin_api_key.clone())
        .await?;
    if admin_key.as_deref() == Some(key) {
        return Ok(Scope::Admin);
    }

    match ctx.registry.resolve_api_key(key).await? {
        Some(group) => Ok(Scope::Group(group)),
        None => Err(EngineError::AuthInvalid),
    }
}
