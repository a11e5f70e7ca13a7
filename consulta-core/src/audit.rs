//! Audit entries emitted by the dispatcher and the sinks that receive them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{TenantId, UserId};
use crate::ports::{AuditSink, EngineError};

/// Marker replacing redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Input keys whose values never reach an audit record.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "apikey",
    "api_key",
    "secret",
    "cpf",
    "cnpj",
    "document",
    "documento",
    "rg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Action recorded by an audit entry.
pub enum AuditAction {
    /// A plugin execution succeeded.
    PluginExecute,
    /// A plugin execution failed.
    PluginExecuteFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// One audit record.
pub struct AuditEntry {
    /// Tenant issuing the call.
    pub tenant_id: TenantId,
    /// User issuing the call.
    pub user_id: UserId,
    /// What happened.
    pub action: AuditAction,
    /// Resource acted upon, the plugin identifier.
    pub resource: String,
    /// Sanitized input and outcome details.
    pub details: Value,
    /// Caller address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// When the entry was created.
    pub timestamp: DateTime<Utc>,
}

/// Replace sensitive values in an input document with [`REDACTED`], recursively.
#[must_use]
pub fn redact_input(input: &Value) -> Value {
    match input {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| {
                    let redacted = if is_sensitive_key(key) {
                        Value::from(REDACTED)
                    } else {
                        redact_input(value)
                    };
                    (key.clone(), redacted)
                })
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_input).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lowered.as_str())
}

/// Audit sink writing entries to the `consulta::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log(&self, entry: AuditEntry) -> Result<(), EngineError> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        tracing::info!(
            target: "consulta::audit",
            tenant = %entry.tenant_id,
            user = %entry.user_id,
            action = ?entry.action,
            resource = %entry.resource,
            details = %details,
            "audit"
        );
        Ok(())
    }
}

/// Audit sink keeping entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log(&self, entry: AuditEntry) -> Result<(), EngineError> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
