//! # Audit Sink
//!
//! Lifecycle events for jobs are handed to an [`AuditSink`] supplied by the
//! host. Audit is best-effort: callers bound each call with a timeout and
//! only log failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::info;

/// One audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: String,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_user_id: Option<String>,
    pub description: String,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        action_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            action_type: action_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor_user_id: None,
            description: description.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_actor(mut self, actor_user_id: Option<String>) -> Self {
        self.actor_user_id = actor_user_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit event rejected: {reason}")]
    Rejected { reason: String },
}

impl AuditError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync + fmt::Debug {
    async fn log_action(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes audit events to the `campus_core::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_action(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "campus_core::audit",
            tenant_id = %event.tenant_id,
            action_type = %event.action_type,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            actor_user_id = event.actor_user_id.as_deref(),
            metadata = %event.metadata,
            "📜 {}",
            event.description
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        let event = AuditEvent::new("t1", "AI_INSIGHT_GENERATED", "student", "s-1", "Job started")
            .with_actor(Some("u-1".to_string()))
            .with_metadata(json!({"attempt": 1}));

        assert!(TracingAuditSink.log_action(event).await.is_ok());
    }
}
