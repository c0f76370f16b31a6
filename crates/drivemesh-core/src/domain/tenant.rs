//! Tenant entity
//!
//! A tenant is one upstream cloud-drive account: its app credentials, quota
//! snapshot, write permission, and position in the federation order. Tenants
//! are persisted as plain documents; the access-token cache fields travel
//! with them so a restart does not force a re-auth of every tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TenantId;

/// Which upstream API surface the tenant's credentials belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// International endpoint.
    Intl,
    /// Mainland-China endpoint.
    Cn,
}

/// What the engine is allowed to do with this tenant's drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

/// App credential pair registered with the upstream platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: String,
}

/// One cloud-drive account inside the federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub display_name: String,
    pub app_credentials: AppCredentials,
    pub platform: Platform,
    /// Total quota in bytes, as last reported by the backend.
    pub quota_bytes: u64,
    /// Used bytes, as last reported. May exceed `quota_bytes`; overruns are
    /// observable, never rejected here.
    pub used_bytes: u64,
    pub permission: Permission,
    pub active: bool,
    /// Position in the federation. Unique per registry; gives the total
    /// order used for aggregated listings and write-target selection.
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(
        display_name: impl Into<String>,
        app_credentials: AppCredentials,
        platform: Platform,
        order: u32,
    ) -> Self {
        Self {
            id: TenantId::new(),
            display_name: display_name.into(),
            app_credentials,
            platform,
            quota_bytes: 0,
            used_bytes: 0,
            permission: Permission::ReadWrite,
            active: true,
            order,
            cached_access_token: None,
            token_expiry: None,
        }
    }

    /// Remaining capacity in bytes (zero when over quota).
    pub fn free_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }

    /// True when the tenant may host new writes at all.
    pub fn is_writable(&self) -> bool {
        self.active && self.permission == Permission::ReadWrite
    }

    /// True when usage exceeds the reported quota.
    pub fn over_quota(&self) -> bool {
        self.used_bytes > self.quota_bytes
    }

    /// Returns the cached access token if it is still valid at `now`.
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.cached_access_token, self.token_expiry) {
            (Some(token), Some(expiry)) if expiry > now => Some(token.as_str()),
            _ => None,
        }
    }

    /// Stores a freshly minted access token.
    pub fn cache_token(&mut self, token: impl Into<String>, expiry: DateTime<Utc>) {
        self.cached_access_token = Some(token.into());
        self.token_expiry = Some(expiry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tenant() -> Tenant {
        Tenant::new(
            "Team Drive",
            AppCredentials {
                app_id: "cli_a1b2".into(),
                app_secret: "s3cr3t".into(),
            },
            Platform::Intl,
            1,
        )
    }

    #[test]
    fn new_tenant_is_writable_by_default() {
        let t = tenant();
        assert!(t.active);
        assert_eq!(t.permission, Permission::ReadWrite);
        assert!(t.is_writable());
    }

    #[test]
    fn read_only_tenant_is_not_writable() {
        let mut t = tenant();
        t.permission = Permission::ReadOnly;
        assert!(!t.is_writable());
    }

    #[test]
    fn inactive_tenant_is_not_writable() {
        let mut t = tenant();
        t.active = false;
        assert!(!t.is_writable());
    }

    #[test]
    fn free_bytes_saturates_on_overrun() {
        let mut t = tenant();
        t.quota_bytes = 100;
        t.used_bytes = 150;
        assert_eq!(t.free_bytes(), 0);
        assert!(t.over_quota());
    }

    #[test]
    fn token_cache_respects_expiry() {
        let mut t = tenant();
        let now = Utc::now();
        assert!(t.valid_token(now).is_none());

        t.cache_token("tok-1", now + Duration::minutes(30));
        assert_eq!(t.valid_token(now), Some("tok-1"));
        assert!(t.valid_token(now + Duration::hours(1)).is_none());
    }

    #[test]
    fn serialization_roundtrip() {
        let t = tenant();
        let json = serde_json::to_string(&t).unwrap();
        let back: Tenant = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn platform_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Platform::Intl).unwrap(), "\"intl\"");
        assert_eq!(serde_json::to_string(&Platform::Cn).unwrap(), "\"cn\"");
        assert_eq!(
            serde_json::to_string(&Permission::ReadOnly).unwrap(),
            "\"read_only\""
        );
    }
}
