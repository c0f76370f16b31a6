//! API audit log entry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCallStatus {
    Success,
    Error,
}

/// One gateway request, as recorded in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// `admin` or the group id the key resolved to.
    pub scope: String,
    pub command: String,
    pub status: ApiCallStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional request/response context, truncated by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl ApiLogEntry {
    pub fn new(
        scope: impl Into<String>,
        command: impl Into<String>,
        status: ApiCallStatus,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            scope: scope.into(),
            command: command.into(),
            status,
            duration_ms,
            message: None,
            meta: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_optional_fields() {
        let entry = ApiLogEntry::new("admin", "add_tenant", ApiCallStatus::Success, 12)
            .with_message("ok")
            .with_meta(serde_json::json!({"tenant": "t1"}));
        assert_eq!(entry.scope, "admin");
        assert_eq!(entry.command, "add_tenant");
        assert_eq!(entry.message.as_deref(), Some("ok"));
        assert_eq!(entry.meta.unwrap()["tenant"], "t1");
    }

    #[test]
    fn serializes_one_line_friendly() {
        let entry = ApiLogEntry::new("g1", "list_transfers", ApiCallStatus::Error, 3);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains('\n'));
        assert!(json.contains("\"status\":\"error\""));
    }
}
