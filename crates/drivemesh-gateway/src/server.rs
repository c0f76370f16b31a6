//! The HTTP listener
//!
//! Hyper 1.x over a plain TCP listener on `0.0.0.0:<port>`. The accept loop
//! follows the service switch: `stop_service` stops accepting and lets
//! in-flight requests run out under the configured timeout, without ending
//! the process; `start_service` binds again. Every request is resolved,
//! parsed, dispatched under the request deadline, answered as JSON, and
//! appended to the audit log.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use drivemesh_core::domain::{ApiCallStatus, ApiLogEntry, EngineError, EngineResult};

use crate::auth::resolve_scope;
use crate::commands::Command;
use crate::dispatch::dispatch;
use crate::GatewayContext;

/// The API gateway server.
pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    bound: Arc<Mutex<Option<SocketAddr>>>,
}

impl GatewayServer {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            bound: Arc::new(Mutex::new(None)),
        }
    }

    /// Address of the live listener, once bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().expect("bound lock")
    }

    /// Runs the listener under the service switch until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> EngineResult<()> {
        let mut desired = self.ctx.service.watch();

        loop {
            // Wait for the switch to ask for a live listener.
            while !*desired.borrow() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    changed = desired.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            let port = self.ctx.config.read(|c| c.gateway.port).await?;
            let timeout_secs = self
                .ctx
                .config
                .read(|c| c.gateway.request_timeout_secs)
                .await?;
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let addr = listener.local_addr()?;
            *self.bound.lock().expect("bound lock") = Some(addr);
            info!(%addr, "Gateway listening");

            let tracker = TaskTracker::new();
            let conn_stop = CancellationToken::new();
            let mut stop_reason_shutdown = false;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        stop_reason_shutdown = true;
                        break;
                    }
                    changed = desired.changed() => {
                        if changed.is_err() || !*desired.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(error = %err, "Accept failed");
                                continue;
                            }
                        };
                        let io = TokioIo::new(stream);
                        let ctx = Arc::clone(&self.ctx);
                        let stop = conn_stop.clone();
                        tracker.spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = Arc::clone(&ctx);
                                async move { Ok::<_, Infallible>(handle_request(ctx, req).await) }
                            });
                            let conn = http1::Builder::new().serve_connection(io, service);
                            tokio::pin!(conn);
                            let result = tokio::select! {
                                result = conn.as_mut() => result,
                                _ = stop.cancelled() => {
                                    // Let the in-flight request finish, then
                                    // close the connection.
                                    conn.as_mut().graceful_shutdown();
                                    conn.as_mut().await
                                }
                            };
                            if let Err(err) = result {
                                error!(error = %err, "Gateway connection error");
                            }
                        });
                    }
                }
            }

            drop(listener);
            *self.bound.lock().expect("bound lock") = None;
            conn_stop.cancel();

            // Graceful: in-flight requests run out under the request timeout.
            tracker.close();
            if tokio::time::timeout(Duration::from_secs(timeout_secs), tracker.wait())
                .await
                .is_err()
            {
                warn!("In-flight requests exceeded the drain deadline");
            }
            info!("Gateway listener stopped");

            if stop_reason_shutdown {
                return Ok(());
            }
        }
    }
}

/// One request: route, authenticate, parse, dispatch, answer, audit.
async fn handle_request(
    ctx: Arc<GatewayContext>,
    req: Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let started = Instant::now();

    let command_name = match route(&req) {
        Ok(name) => name,
        Err(err) => return error_response(&err),
    };

    let api_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return error_response(&EngineError::InvalidArgument(format!(
                "request body: {err}"
            )))
        }
    };

    // Authentication failures are audited under an anonymous scope.
    let scope = match resolve_scope(&ctx, api_key.as_deref()).await {
        Ok(scope) => scope,
        Err(err) => {
            audit(&ctx, "anonymous", &command_name, &Err(err.clone()), started).await;
            return error_response(&err);
        }
    };
    let scope_label = scope.label();

    let command = match Command::parse(&command_name, &body) {
        Ok(command) => command,
        Err(err) => {
            audit(&ctx, &scope_label, &command_name, &Err(err.clone()), started).await;
            return error_response(&err);
        }
    };

    let timeout_secs = ctx
        .config
        .read(|c| c.gateway.request_timeout_secs)
        .await
        .unwrap_or(120);
    let result = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        dispatch(&ctx, &scope, command),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(timeout_secs)),
    };

    audit(&ctx, &scope_label, &command_name, &result, started).await;

    match result {
        Ok(data) => ok_response(data),
        Err(err) => error_response(&err),
    }
}

/// Extracts the command name from `POST /command/<name>`.
fn route(req: &Request<hyper::body::Incoming>) -> EngineResult<String> {
    if req.method() != Method::POST {
        return Err(EngineError::NotFound(format!(
            "{} {}",
            req.method(),
            req.uri().path()
        )));
    }
    req.uri()
        .path()
        .strip_prefix("/command/")
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .map(|name| name.to_string())
        .ok_or_else(|| EngineError::NotFound(req.uri().path().to_string()))
}

/// Appends the request's audit entry; failures only warn.
async fn audit(
    ctx: &GatewayContext,
    scope: &str,
    command: &str,
    result: &EngineResult<serde_json::Value>,
    started: Instant,
) {
    let duration_ms = started.elapsed().as_millis() as u64;
    let entry = match result {
        Ok(_) => ApiLogEntry::new(scope, command, ApiCallStatus::Success, duration_ms),
        Err(err) => ApiLogEntry::new(scope, command, ApiCallStatus::Error, duration_ms)
            .with_message(err.to_string())
            .with_meta(serde_json::json!({ "kind": err.kind() })),
    };
    if let Err(err) = ctx.audit.append(&entry).await {
        warn!(error = %err, "Failed to append audit entry");
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::AuthMissing | EngineError::AuthInvalid => StatusCode::UNAUTHORIZED,
        EngineError::ScopeDenied(_) => StatusCode::FORBIDDEN,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidArgument(_) | EngineError::InvalidCron(_) => StatusCode::BAD_REQUEST,
        EngineError::DuplicateName(_)
        | EngineError::Conflict(_)
        | EngineError::NoWritableTenant { .. }
        | EngineError::Cancelled => StatusCode::CONFLICT,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::UpstreamTransient(_)
        | EngineError::UpstreamPermanent(_)
        | EngineError::UpstreamRateLimited { .. }
        | EngineError::LocalIo(_)
        | EngineError::PersistenceCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ok_response(data: serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "ok": true, "data": data });
    json_response(StatusCode::OK, body)
}

fn error_response(err: &EngineError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "ok": false,
        "error": { "kind": err.kind(), "message": err.to_string() },
    });
    json_response(status_for(err), body)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response parts")
}
