//! HTTP drive backend
//!
//! Typed client for the upstream drive's REST surface. One instance serves
//! every tenant: the platform field on the tenant picks the endpoint, the
//! token manager supplies credentials, and a per-tenant rate limiter keeps
//! request bursts below the upstream's throttle threshold.
//!
//! Upstream failures are mapped onto the engine taxonomy here and nowhere
//! else: 429 becomes `UpstreamRateLimited`, 5xx `UpstreamTransient`, other
//! client errors `UpstreamPermanent`, and client-side deadline overruns
//! `Timeout`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use drivemesh_core::domain::{EngineError, EngineResult, Platform, Tenant};
use drivemesh_core::ports::{
    DriveBackend, DriveQuota, EntryKind, EntryMetadata, RemoteEntry, UploadSession,
};

use crate::auth::TokenManager;

/// International API endpoint.
const INTL_BASE_URL: &str = "https://open.meshdrive.io/api/v1";
/// Mainland-China API endpoint.
const CN_BASE_URL: &str = "https://open.meshdrive.cn/api/v1";

/// Requests allowed per second per tenant.
const REQUESTS_PER_SECOND: u32 = 20;

type TenantLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Debug, Deserialize)]
struct RootResponse {
    root_token: String,
    entries: Vec<RemoteEntry>,
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    entries: Vec<RemoteEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenOnlyResponse {
    token: String,
}

/// [`DriveBackend`] over the upstream REST API.
pub struct HttpDriveBackend {
    http: reqwest::Client,
    tokens: TokenManager,
    limiter: TenantLimiter,
    deadline_secs: u64,
    base_intl: String,
    base_cn: String,
}

impl HttpDriveBackend {
    /// Creates a backend whose calls all carry the given deadline.
    pub fn new(deadline: Duration) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .map_err(|e| EngineError::InvalidArgument(format!("http client: {e}")))?;
        let deadline_secs = deadline.as_secs();
        Ok(Self {
            tokens: TokenManager::new(http.clone(), deadline_secs),
            http,
            limiter: RateLimiter::keyed(Quota::per_second(
                NonZeroU32::new(REQUESTS_PER_SECOND).expect("nonzero"),
            )),
            deadline_secs,
            base_intl: INTL_BASE_URL.to_string(),
            base_cn: CN_BASE_URL.to_string(),
        })
    }

    /// Points both platforms at one base URL (used by tests).
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.base_intl = base.clone();
        self.base_cn = base;
        self
    }

    /// Attaches the sink that persists freshly minted tokens onto tenant
    /// records, so they survive a restart.
    pub fn with_token_sink(
        mut self,
        sink: std::sync::Arc<dyn drivemesh_core::ports::TokenSink>,
    ) -> Self {
        self.tokens.set_sink(sink);
        self
    }

    fn base_for(&self, tenant: &Tenant) -> &str {
        match tenant.platform {
            Platform::Intl => &self.base_intl,
            Platform::Cn => &self.base_cn,
        }
    }

    /// Builds an authenticated request after passing the tenant's rate gate.
    async fn request(
        &self,
        tenant: &Tenant,
        method: Method,
        path: &str,
    ) -> EngineResult<reqwest::RequestBuilder> {
        self.limiter
            .until_key_ready(&tenant.id.as_str().to_string())
            .await;
        let base = self.base_for(tenant);
        let token = self.tokens.access_token(base, tenant).await?;
        debug!(tenant = %tenant.id, %method, path, "Backend request");
        Ok(self
            .http
            .request(method, format!("{base}{path}"))
            .bearer_auth(token))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> EngineResult<T> {
        let response = rb
            .send()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))
    }

    async fn send_empty(&self, rb: reqwest::RequestBuilder) -> EngineResult<()> {
        let response = rb
            .send()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl DriveBackend for HttpDriveBackend {
    async fn list_root(&self, tenant: &Tenant) -> EngineResult<(String, Vec<RemoteEntry>)> {
        let rb = self.request(tenant, Method::GET, "/drive/root").await?;
        let body: RootResponse = self.send_json(rb).await?;
        Ok((body.root_token, body.entries))
    }

    async fn list_folder(
        &self,
        tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        let rb = self
            .request(
                tenant,
                Method::GET,
                &format!("/drive/folders/{folder_token}/children"),
            )
            .await?;
        let body: ChildrenResponse = self.send_json(rb).await?;
        Ok(body.entries)
    }

    async fn metadata(&self, tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata> {
        let rb = self
            .request(tenant, Method::GET, &format!("/drive/files/{token}/meta"))
            .await?;
        self.send_json(rb).await
    }

    async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        let rb = self
            .request(
                tenant,
                Method::POST,
                &format!("/drive/folders/{parent_token}/children"),
            )
            .await?
            .json(&serde_json::json!({ "name": name }));
        let body: TokenOnlyResponse = self.send_json(rb).await?;
        Ok(body.token)
    }

    async fn move_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
    ) -> EngineResult<()> {
        let rb = self
            .request(tenant, Method::POST, &format!("/drive/files/{token}/move"))
            .await?
            .json(&serde_json::json!({ "new_parent": new_parent }));
        self.send_empty(rb).await
    }

    async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String> {
        let rb = self
            .request(tenant, Method::POST, &format!("/drive/files/{token}/copy"))
            .await?
            .json(&serde_json::json!({ "new_parent": new_parent, "new_name": new_name }));
        let body: TokenOnlyResponse = self.send_json(rb).await?;
        Ok(body.token)
    }

    async fn delete_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        kind: EntryKind,
    ) -> EngineResult<()> {
        let type_param = match kind {
            EntryKind::Folder => "folder",
            _ => "file",
        };
        let rb = self
            .request(
                tenant,
                Method::DELETE,
                &format!("/drive/files/{token}?type={type_param}"),
            )
            .await?;
        self.send_empty(rb).await
    }

    async fn upload_init(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        size: u64,
    ) -> EngineResult<UploadSession> {
        let rb = self
            .request(tenant, Method::POST, "/drive/uploads")
            .await?
            .json(&serde_json::json!({
                "parent_token": parent_token,
                "file_name": file_name,
                "size": size,
            }));
        self.send_json(rb).await
    }

    async fn upload_block(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()> {
        let rb = self
            .request(
                tenant,
                Method::PUT,
                &format!("/drive/uploads/{upload_id}/blocks/{seq}"),
            )
            .await?
            .header("Content-Type", "application/octet-stream")
            .body(bytes);
        self.send_empty(rb).await
    }

    async fn upload_finish(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<String> {
        let rb = self
            .request(
                tenant,
                Method::POST,
                &format!("/drive/uploads/{upload_id}/finish"),
            )
            .await?;
        let body: TokenOnlyResponse = self.send_json(rb).await?;
        Ok(body.token)
    }

    async fn upload_abort(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<()> {
        let rb = self
            .request(
                tenant,
                Method::DELETE,
                &format!("/drive/uploads/{upload_id}"),
            )
            .await?;
        self.send_empty(rb).await
    }

    async fn download_range(
        &self,
        tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let rb = self
            .request(
                tenant,
                Method::GET,
                &format!("/drive/files/{token}/content"),
            )
            .await?
            .header("Range", format!("bytes={}-{}", offset, offset + len - 1));

        let response = rb
            .send()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;

        // Past-EOF range means the caller has everything.
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, self.deadline_secs))?;
        Ok(bytes.to_vec())
    }

    async fn quota(&self, tenant: &Tenant) -> EngineResult<DriveQuota> {
        let rb = self.request(tenant, Method::GET, "/drive/quota").await?;
        self.send_json(rb).await
    }
}

// ----------------------------------------------------------------------
// Error mapping shared with the token manager
// ----------------------------------------------------------------------

/// Maps a non-success HTTP status onto the engine taxonomy.
pub(crate) async fn check_status(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    Err(match status {
        StatusCode::NOT_FOUND => EngineError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => EngineError::UpstreamRateLimited { retry_after_secs },
        s if s.is_server_error() => EngineError::UpstreamTransient(detail),
        s if s == StatusCode::REQUEST_TIMEOUT => EngineError::UpstreamTransient(detail),
        _ => EngineError::UpstreamPermanent(detail),
    })
}

/// Maps a reqwest transport failure onto the engine taxonomy.
pub(crate) fn map_send_error(err: reqwest::Error, deadline_secs: u64) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(deadline_secs)
    } else {
        EngineError::UpstreamTransient(err.to_string())
    }
}

// Status-code mapping and the full request surface are exercised against a
// live mock server in `tests/http_backend.rs`.
