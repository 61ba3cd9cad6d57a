//! Audit events for denied requests.
//!
//! The limiter only returns decisions. Callers turn a denial into an
//! [`AuditEvent`] and hand it to an [`AuditSink`] after the check returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::category::Category;
use super::decision::Decision;

/// Action recorded when a request is denied by the limiter.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Resource type for limiter events.
pub const RESOURCE_SYSTEM: &str = "system";

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: &'static str,
    pub resource_type: &'static str,
    pub category: Category,
    /// `"identity"` or `"address"`
    pub key_kind: &'static str,
    pub key: String,
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// The event for a denied decision.
    pub fn rate_limit_exceeded(decision: &Decision) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: RATE_LIMIT_EXCEEDED,
            resource_type: RESOURCE_SYSTEM,
            category: decision.category,
            key_kind: decision.key.kind(),
            key: decision.key.value().to_string(),
            details: json!({
                "limit": decision.limit,
                "remaining": decision.remaining,
                "retry_after_secs": decision.retry_after_secs(),
                "blocked": decision.blocked,
            }),
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes audit events as structured log lines under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            id = %event.id,
            action = event.action,
            resource_type = event.resource_type,
            category = %event.category,
            key_kind = event.key_kind,
            key = %event.key,
            details = %event.details,
            "AUDIT: rate limit exceeded"
        );
    }
}

/// Keeps events in memory, for embedding callers and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
