//! Tenant access-token management
//!
//! Each tenant authenticates with its app credential pair and receives a
//! short-lived access token. Tokens are cached per tenant and refreshed
//! ahead of expiry. The cache is seeded from the token persisted on the
//! tenant record, and fresh tokens are handed back through the
//! [`TokenSink`] port, so a restart does not re-authenticate every tenant.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use drivemesh_core::domain::{EngineResult, Tenant};
use drivemesh_core::ports::TokenSink;

use crate::http::{check_status, map_send_error};

/// Tokens are refreshed when less than this many seconds remain.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds.
    expires_in: i64,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expiry: DateTime<Utc>,
}

/// Per-tenant access-token cache with refresh-ahead.
pub struct TokenManager {
    http: reqwest::Client,
    deadline_secs: u64,
    cache: DashMap<String, CachedToken>,
    /// Durable destination for fresh tokens (the tenant registry).
    sink: Option<Arc<dyn TokenSink>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, deadline_secs: u64) -> Self {
        Self {
            http,
            deadline_secs,
            cache: DashMap::new(),
            sink: None,
        }
    }

    /// Attaches the sink that persists fresh tokens onto tenant records.
    pub fn set_sink(&mut self, sink: Arc<dyn TokenSink>) {
        self.sink = Some(sink);
    }

    /// Returns a valid access token for the tenant, fetching a fresh one if
    /// neither the in-memory cache nor the tenant record holds one.
    pub async fn access_token(&self, base_url: &str, tenant: &Tenant) -> EngineResult<String> {
        let now = Utc::now();
        let margin = Duration::seconds(REFRESH_MARGIN_SECS);

        if let Some(cached) = self.cache.get(tenant.id.as_str()) {
            if cached.expiry - margin > now {
                return Ok(cached.token.clone());
            }
        }
        if let Some(token) = tenant.valid_token(now + margin) {
            self.cache.insert(
                tenant.id.as_str().to_string(),
                CachedToken {
                    token: token.to_string(),
                    expiry: tenant.token_expiry.unwrap_or(now),
                },
            );
            return Ok(token.to_string());
        }

        let fresh = self.fetch(base_url, tenant).await?;
        self.cache
            .insert(tenant.id.as_str().to_string(), fresh.clone());

        // Persist the token onto the tenant record. Failure only warns: the
        // token still works for this process lifetime.
        if let Some(sink) = &self.sink {
            if let Err(err) = sink
                .store_token(&tenant.id, &fresh.token, fresh.expiry)
                .await
            {
                warn!(tenant_id = %tenant.id, error = %err, "Failed to persist refreshed token");
            }
        }

        Ok(fresh.token)
    }

    /// Drops the cached token for a tenant, forcing a refresh on next use.
    pub fn invalidate(&self, tenant: &Tenant) {
        self.cache.remove(tenant.id.as_str());
    }

    async fn fetch(&self, base_url: &str, tenant: &Tenant) -> EngineResult<CachedToken> {
        debug!(tenant = %tenant.id, "Fetching fresh access token");
        let response = self
            .http
            .post(format!("{base_url}/auth/tenant_token"))
            .json(&serde_json::json!({
                "app_id": tenant.app_credentials.app_id,
                "app_secret": tenant.app_credentials.app_secret,
            }))
            .send()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;

        let response = check_status(response).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;

        Ok(CachedToken {
            expiry: Utc::now() + Duration::seconds(body.expires_in),
            token: body.access_token,
        })
    }
}
