//! Engine error taxonomy
//!
//! One enum covers every failure the engine surfaces to callers. The
//! [`EngineError::kind`] identifiers are stable strings: the gateway maps
//! them to HTTP statuses and the audit log records them verbatim, so renaming
//! a variant is a wire-format change.

use thiserror::Error;

/// Why no tenant could be selected as a write target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDenyReason {
    /// Every candidate tenant is inactive or read-only.
    Permission,
    /// Writable tenants exist but none has free capacity above the threshold.
    Capacity,
}

impl std::fmt::Display for WriteDenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteDenyReason::Permission => write!(f, "permission"),
            WriteDenyReason::Capacity => write!(f, "capacity"),
        }
    }
}

/// Failures surfaced by any engine component.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Request carried no `X-API-Key` header.
    #[error("missing API key")]
    AuthMissing,

    /// The presented API key matches neither the admin key nor any group.
    #[error("unrecognized API key")]
    AuthInvalid,

    /// The key is valid but the operation targets something outside its group.
    #[error("operation denied for this key's scope: {0}")]
    ScopeDenied(String),

    /// A referenced entity (tenant, group, task, transfer, remote entry) is gone.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live entry with the same name already exists under the parent folder.
    #[error("an entry named '{0}' already exists in the target folder")]
    DuplicateName(String),

    /// No tenant qualifies as a write target.
    #[error("no writable tenant available ({reason})")]
    NoWritableTenant { reason: WriteDenyReason },

    /// A request field failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cron expression did not parse under the 5-field grammar.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The upstream drive failed in a way worth retrying.
    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),

    /// The upstream drive rejected the request definitively.
    #[error("upstream rejected the request: {0}")]
    UpstreamPermanent(String),

    /// The upstream drive asked us to back off.
    #[error("upstream rate limited (retry after {retry_after_secs}s)")]
    UpstreamRateLimited { retry_after_secs: u64 },

    /// A network call exceeded its deadline.
    #[error("deadline exceeded after {0}s")]
    Timeout(u64),

    /// Local filesystem failure.
    #[error("local I/O error: {0}")]
    LocalIo(String),

    /// A persisted document failed to parse; mutations are refused until the
    /// operator resolves it.
    #[error("persistent state corrupt: {0}")]
    PersistenceCorrupt(String),

    /// The operation was cancelled by the user or by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The entity is in a state that forbids the requested transition.
    #[error("state conflict: {0}")]
    Conflict(String),
}

impl EngineError {
    /// Stable identifier for the error kind, used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AuthMissing => "AuthMissing",
            EngineError::AuthInvalid => "AuthInvalid",
            EngineError::ScopeDenied(_) => "ScopeDenied",
            EngineError::NotFound(_) => "NotFound",
            EngineError::DuplicateName(_) => "DuplicateName",
            EngineError::NoWritableTenant { .. } => "NoWritableTenant",
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::InvalidCron(_) => "InvalidCron",
            EngineError::UpstreamTransient(_) => "UpstreamTransient",
            EngineError::UpstreamPermanent(_) => "UpstreamPermanent",
            EngineError::UpstreamRateLimited { .. } => "UpstreamRateLimited",
            EngineError::Timeout(_) => "Timeout",
            EngineError::LocalIo(_) => "LocalIo",
            EngineError::PersistenceCorrupt(_) => "PersistenceCorrupt",
            EngineError::Cancelled => "Cancelled",
            EngineError::Conflict(_) => "Conflict",
        }
    }

    /// Whether a retry inside the raising component is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamTransient(_)
                | EngineError::UpstreamRateLimited { .. }
                | EngineError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::LocalIo(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::PersistenceCorrupt(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
