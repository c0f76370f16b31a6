//! Token persistence port (driven/secondary port)
//!
//! Backends mint short-lived access tokens per tenant. This port lets them
//! hand a fresh token back to whatever owns the tenant records, so the
//! `cached_access_token`/`token_expiry` fields persisted on the Tenant
//! survive a restart instead of forcing a re-authentication of every tenant.

use chrono::{DateTime, Utc};

use crate::domain::errors::EngineResult;
use crate::domain::ids::TenantId;

/// Receives freshly minted access tokens for durable storage.
///
/// Implementations persist the token onto the tenant's record. Callers treat
/// failures as non-fatal: a token that could not be persisted still works
/// for the current process lifetime.
#[async_trait::async_trait]
pub trait TokenSink: Send + Sync {
    /// Stores `access_token` (valid until `expiry`) on the tenant's record.
    async fn store_token(
        &self,
        tenant_id: &TenantId,
        access_token: &str,
        expiry: DateTime<Utc>,
    ) -> EngineResult<()>;
}
