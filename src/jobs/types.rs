//! # Job Types and Identity
//!
//! The closed set of background job types, the request metadata every job
//! carries, the serialized envelope used for broker hand-off, and the
//! deterministic idempotency key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Namespace for v5 job-key UUIDs. Changing it invalidates every stored key.
const JOB_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b8e_a1c5_0d2f_7e94_b316);

/// Background job types known to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Generate AI insights for one student and term
    AiInsight,
    /// Materialize a daily analytics snapshot
    AnalyticsSnapshot,
    /// Render an inspection report export
    ExportInspection,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::AiInsight,
        JobType::AnalyticsSnapshot,
        JobType::ExportInspection,
    ];

    /// Stable identifier used by the registry allowlist and the broker
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::AiInsight => "ai_insight",
            Self::AnalyticsSnapshot => "analytics_snapshot",
            Self::ExportInspection => "export_inspection",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|job_type| job_type.identifier() == identifier)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Who asked for the job and in which tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub tenant_id: String,
    pub actor_user_id: Option<String>,
    pub request_id: Option<String>,
}

impl JobMeta {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_user_id: None,
            request_id: None,
        }
    }

    pub fn with_actor(mut self, actor_user_id: impl Into<String>) -> Self {
        self.actor_user_id = Some(actor_user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Serialized form of a job, as handed to a broker and reconstructed by workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Registry identifier, e.g. `ai_insight`
    pub job_type: String,
    pub meta: JobMeta,
    /// Identifying parameters of the job
    pub params: Value,
    /// Ledger record created by the dispatcher before hand-off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
}

/// Derive the idempotency key for a job
///
/// The key depends only on the job type, tenant and identifying parameters.
/// `serde_json` objects are key-sorted, so the serialized parameters are
/// canonical regardless of construction order.
pub fn derive_job_key(job_type: JobType, tenant_id: &str, params: &Value) -> String {
    let canonical = format!("{}\u{1f}{}\u{1f}{}", job_type.identifier(), tenant_id, params);
    let digest = Uuid::new_v5(&JOB_KEY_NAMESPACE, canonical.as_bytes());
    format!("{}:{}", job_type.identifier(), digest.simple())
}
