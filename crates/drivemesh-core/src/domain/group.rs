//! Group entity
//!
//! A group is a named subset of tenants sharing one API key; it is the unit
//! of scope for the gateway. Key material is a high-entropy opaque token.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::{GroupId, TenantId};

/// Prefix for generated group API keys, handy when grepping logs.
const API_KEY_PREFIX: &str = "dmk_";

/// A named subset of tenants forming one access scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub remark: String,
    /// Member tenants. Every id must reference a live tenant; the registry
    /// scrubs memberships when a tenant is deleted.
    pub tenant_ids: BTreeSet<TenantId>,
    pub api_key: String,
}

impl Group {
    pub fn new(name: impl Into<String>, remark: impl Into<String>) -> Self {
        Self {
            id: GroupId::new(),
            name: name.into(),
            remark: remark.into(),
            tenant_ids: BTreeSet::new(),
            api_key: generate_api_key(),
        }
    }

    pub fn contains(&self, tenant_id: &TenantId) -> bool {
        self.tenant_ids.contains(tenant_id)
    }

    /// Replaces the API key, leaving every other field intact.
    pub fn regenerate_key(&mut self) -> &str {
        self.api_key = generate_api_key();
        &self.api_key
    }
}

/// Produces a fresh opaque API key (two concatenated UUIDv4s).
pub fn generate_api_key() -> String {
    format!(
        "{}{}{}",
        API_KEY_PREFIX,
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
