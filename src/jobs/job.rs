//! The [`Job`] capability, the context passed to each attempt and the
//! domain services jobs delegate their business logic to.

use super::errors::JobError;
use super::types::{derive_job_key, JobEnvelope, JobMeta, JobType};
use crate::resilience::{CircuitBreaker, CircuitBreakers, Feature};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Business operations the built-in jobs delegate to; supplied by the host
#[async_trait]
pub trait DomainServices: Send + Sync + fmt::Debug {
    /// Generate AI insights for one student and term
    async fn generate_insight(
        &self,
        tenant_id: &str,
        student_id: &str,
        term: &str,
    ) -> Result<Value, JobError>;

    /// Materialize the analytics snapshot for one day
    async fn build_analytics_snapshot(
        &self,
        tenant_id: &str,
        snapshot_date: NaiveDate,
    ) -> Result<Value, JobError>;

    /// Render an inspection report in the requested format
    async fn inspect_export(
        &self,
        tenant_id: &str,
        inspection_id: &str,
        format: &str,
    ) -> Result<Value, JobError>;
}

/// Everything one attempt of a job can see
#[derive(Clone)]
pub struct JobContext {
    pub meta: JobMeta,
    pub job_key: String,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub services: Arc<dyn DomainServices>,
    pub breakers: CircuitBreakers,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("tenant_id", &self.meta.tenant_id)
            .field("job_key", &self.job_key)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl JobContext {
    pub fn breaker(&self, feature: Feature) -> CircuitBreaker {
        self.breakers.breaker(feature)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A unit of background work
///
/// `execute` returns the result summary stored on the ledger record. Errors
/// carry an explicit [`ErrorKind`](super::ErrorKind); the runner decides
/// whether to retry from that alone.
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    fn job_type(&self) -> JobType;

    fn meta(&self) -> &JobMeta;

    /// Identifying parameters; the idempotency key is derived from these
    fn params(&self) -> Value;

    fn entity_type(&self) -> &'static str;

    fn entity_id(&self) -> String;

    fn job_key(&self) -> String {
        derive_job_key(self.job_type(), &self.meta().tenant_id, &self.params())
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError>;

    async fn on_success(&self, _ctx: &JobContext, _result: &Value) {}

    async fn on_failure(&self, _ctx: &JobContext, _error: &JobError) {}

    async fn on_retry(&self, _ctx: &JobContext, _error: &JobError, _next_attempt: u32) {}

    /// Serialized form for broker hand-off
    fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            job_type: self.job_type().identifier().to_string(),
            meta: self.meta().clone(),
            params: self.params(),
            record_id: None,
        }
    }
}
