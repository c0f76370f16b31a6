//! Engine configuration
//!
//! Typed view of the persisted `config.json` document, with defaults,
//! clamping, and validation. Configuration is read and written exclusively
//! through the document store; environment variables are never consulted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Audit log size cap bounds (MB).
pub const AUDIT_CAP_MIN_MB: u64 = 5;
pub const AUDIT_CAP_MAX_MB: u64 = 2048;

/// Top-level engine configuration, persisted as `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub transfers: TransferConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// API gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TCP port the listener binds on `0.0.0.0`.
    pub port: u16,
    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,
    /// Process-wide admin key. Auto-generated on first start and written
    /// back to the document; `None` only before that first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<String>,
}

/// Transfer engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Worker pool size per direction (uploads and downloads each).
    pub workers_per_direction: usize,
    /// Concurrent transfers allowed against one tenant.
    pub per_tenant_parallelism: usize,
    /// Base delay for block retry backoff, in milliseconds.
    pub retry_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub retry_cap_ms: u64,
    /// Attempts per block before the transfer fails.
    pub retry_attempts: u32,
}

/// Drive backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Deadline for a single upstream call, in seconds.
    pub call_deadline_secs: u64,
    /// Bounded fan-out for federated root listings.
    pub list_concurrency: usize,
}

/// Audit log settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Log directory; defaults to `<data_dir>/api_logs` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Total on-disk budget for active file plus archives, in MB.
    #[serde(default = "default_audit_cap_mb")]
    pub max_size_mb: u64,
}

fn default_audit_cap_mb() -> u64 {
    64
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 6688,
            request_timeout_secs: 120,
            admin_api_key: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers_per_direction: 3,
            per_tenant_parallelism: 2,
            retry_base_ms: 500,
            retry_cap_ms: 10_000,
            retry_attempts: 5,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            call_deadline_secs: 60,
            list_concurrency: 5,
        }
    }
}

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"transfers.retry_attempts"`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl EngineConfig {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.gateway.port == 0 {
            errors.push(ValidationError {
                field: "gateway.port".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.gateway.request_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "gateway.request_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.transfers.workers_per_direction == 0 {
            errors.push(ValidationError {
                field: "transfers.workers_per_direction".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.transfers.per_tenant_parallelism == 0 {
            errors.push(ValidationError {
                field: "transfers.per_tenant_parallelism".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.transfers.retry_attempts == 0 {
            errors.push(ValidationError {
                field: "transfers.retry_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.transfers.retry_base_ms > self.transfers.retry_cap_ms {
            errors.push(ValidationError {
                field: "transfers.retry_base_ms".into(),
                message: format!(
                    "retry_base_ms ({}) must not exceed retry_cap_ms ({})",
                    self.transfers.retry_base_ms, self.transfers.retry_cap_ms
                ),
            });
        }

        if self.backend.call_deadline_secs == 0 {
            errors.push(ValidationError {
                field: "backend.call_deadline_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.backend.list_concurrency == 0 || self.backend.list_concurrency > 5 {
            errors.push(ValidationError {
                field: "backend.list_concurrency".into(),
                message: "must be in range 1..=5".into(),
            });
        }

        if !(AUDIT_CAP_MIN_MB..=AUDIT_CAP_MAX_MB).contains(&self.audit.max_size_mb) {
            errors.push(ValidationError {
                field: "audit.max_size_mb".into(),
                message: format!("must be in range {AUDIT_CAP_MIN_MB}..={AUDIT_CAP_MAX_MB}"),
            });
        }

        errors
    }

    /// Ensures the admin key exists, generating one on first start.
    /// Returns true when a key was generated (the document needs persisting).
    pub fn ensure_admin_key(&mut self) -> bool {
        if self.gateway.admin_api_key.is_none() {
            self.gateway.admin_api_key = Some(crate::domain::group::generate_api_key());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.gateway.port, 6688);
        assert_eq!(cfg.gateway.request_timeout_secs, 120);
        assert!(cfg.gateway.admin_api_key.is_none());
        assert_eq!(cfg.transfers.workers_per_direction, 3);
        assert_eq!(cfg.transfers.per_tenant_parallelism, 2);
        assert_eq!(cfg.transfers.retry_base_ms, 500);
        assert_eq!(cfg.transfers.retry_cap_ms, 10_000);
        assert_eq!(cfg.transfers.retry_attempts, 5);
        assert_eq!(cfg.backend.call_deadline_secs, 60);
        assert_eq!(cfg.backend.list_concurrency, 5);
        assert_eq!(cfg.audit.max_size_mb, 64);
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(EngineConfig::default().validate().is_empty());
    }

    #[test]
    fn validate_catches_zero_port() {
        let mut cfg = EngineConfig::default();
        cfg.gateway.port = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "gateway.port"));
    }

    #[test]
    fn validate_catches_zero_workers() {
        let mut cfg = EngineConfig::default();
        cfg.transfers.workers_per_direction = 0;
        cfg.transfers.per_tenant_parallelism = 0;
        let errors = cfg.validate();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"transfers.workers_per_direction"));
        assert!(fields.contains(&"transfers.per_tenant_parallelism"));
    }

    #[test]
    fn validate_catches_inverted_backoff() {
        let mut cfg = EngineConfig::default();
        cfg.transfers.retry_base_ms = 20_000;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "transfers.retry_base_ms" && e.message.contains("must not exceed")));
    }

    #[test]
    fn validate_bounds_audit_cap() {
        let mut cfg = EngineConfig::default();
        cfg.audit.max_size_mb = 4;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "audit.max_size_mb"));

        cfg.audit.max_size_mb = 4096;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "audit.max_size_mb"));

        cfg.audit.max_size_mb = 2048;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_bounds_list_concurrency() {
        let mut cfg = EngineConfig::default();
        cfg.backend.list_concurrency = 6;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "backend.list_concurrency"));
    }

    #[test]
    fn ensure_admin_key_generates_once() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.ensure_admin_key());
        let key = cfg.gateway.admin_api_key.clone().unwrap();
        assert!(!cfg.ensure_admin_key());
        assert_eq!(cfg.gateway.admin_api_key.as_deref(), Some(key.as_str()));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.gateway.port, 6688);
        assert_eq!(cfg.audit.max_size_mb, 64);
    }
}
