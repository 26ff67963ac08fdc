//! Built-in job types.
//!
//! Each job owns its typed parameters. Calls into [`DomainServices`] go
//! through the circuit breaker of the capability they depend on, so an open
//! circuit surfaces as a retryable failure instead of hammering a failing
//! dependency.
//!
//! [`DomainServices`]: super::DomainServices

use super::errors::JobError;
use super::job::{Job, JobContext};
use super::types::{JobMeta, JobType};
use crate::resilience::Feature;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

fn decode_params<P: DeserializeOwned>(job_type: JobType, params: Value) -> Result<P, JobError> {
    serde_json::from_value(params)
        .map_err(|e| JobError::invalid_params(format!("Invalid {job_type} parameters: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::invalid_params(format!("{field} must not be empty")));
    }
    Ok(())
}

fn encode_params<P: Serialize>(params: &P) -> Value {
    serde_json::to_value(params).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// AI insight
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiInsightParams {
    pub student_id: String,
    pub term: String,
}

/// Generates AI insights for one student and term
#[derive(Debug, Clone)]
pub struct AiInsightJob {
    meta: JobMeta,
    params: AiInsightParams,
}

impl AiInsightJob {
    pub fn new(meta: JobMeta, params: AiInsightParams) -> Result<Self, JobError> {
        require_non_empty("student_id", &params.student_id)?;
        require_non_empty("term", &params.term)?;
        Ok(Self { meta, params })
    }

    pub fn from_value(meta: JobMeta, params: Value) -> Result<Self, JobError> {
        Self::new(meta, decode_params(JobType::AiInsight, params)?)
    }

    pub fn insight_params(&self) -> &AiInsightParams {
        &self.params
    }
}

#[async_trait]
impl Job for AiInsightJob {
    fn job_type(&self) -> JobType {
        JobType::AiInsight
    }

    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn params(&self) -> Value {
        encode_params(&self.params)
    }

    fn entity_type(&self) -> &'static str {
        "student"
    }

    fn entity_id(&self) -> String {
        self.params.student_id.clone()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let services = &ctx.services;
        ctx.breaker(Feature::AiInsights)
            .call(|| {
                services.generate_insight(
                    &self.meta.tenant_id,
                    &self.params.student_id,
                    &self.params.term,
                )
            })
            .await
            .map_err(JobError::from_breaker)
    }

    async fn on_retry(&self, ctx: &JobContext, error: &JobError, next_attempt: u32) {
        debug!(
            job_key = %ctx.job_key,
            student_id = %self.params.student_id,
            next_attempt = next_attempt,
            error = %error,
            "AI insight generation will be retried"
        );
    }
}

// ---------------------------------------------------------------------------
// Analytics snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSnapshotParams {
    pub snapshot_date: NaiveDate,
}

/// Materializes the analytics snapshot for one day
#[derive(Debug, Clone)]
pub struct AnalyticsSnapshotJob {
    meta: JobMeta,
    params: AnalyticsSnapshotParams,
}

impl AnalyticsSnapshotJob {
    pub fn new(meta: JobMeta, params: AnalyticsSnapshotParams) -> Result<Self, JobError> {
        Ok(Self { meta, params })
    }

    pub fn from_value(meta: JobMeta, params: Value) -> Result<Self, JobError> {
        Self::new(meta, decode_params(JobType::AnalyticsSnapshot, params)?)
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        self.params.snapshot_date
    }
}

#[async_trait]
impl Job for AnalyticsSnapshotJob {
    fn job_type(&self) -> JobType {
        JobType::AnalyticsSnapshot
    }

    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn params(&self) -> Value {
        encode_params(&self.params)
    }

    fn entity_type(&self) -> &'static str {
        "analytics_snapshot"
    }

    fn entity_id(&self) -> String {
        self.params.snapshot_date.to_string()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let services = &ctx.services;
        ctx.breaker(Feature::AnalyticsEngine)
            .call(|| {
                services.build_analytics_snapshot(&self.meta.tenant_id, self.params.snapshot_date)
            })
            .await
            .map_err(JobError::from_breaker)
    }
}

// ---------------------------------------------------------------------------
// Inspection export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Pdf,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInspectionParams {
    pub inspection_id: String,
    #[serde(default)]
    pub format: ExportFormat,
}

/// Renders an inspection report export
#[derive(Debug, Clone)]
pub struct ExportInspectionJob {
    meta: JobMeta,
    params: ExportInspectionParams,
}

impl ExportInspectionJob {
    pub fn new(meta: JobMeta, params: ExportInspectionParams) -> Result<Self, JobError> {
        require_non_empty("inspection_id", &params.inspection_id)?;
        Ok(Self { meta, params })
    }

    pub fn from_value(meta: JobMeta, params: Value) -> Result<Self, JobError> {
        Self::new(meta, decode_params(JobType::ExportInspection, params)?)
    }
}

#[async_trait]
impl Job for ExportInspectionJob {
    fn job_type(&self) -> JobType {
        JobType::ExportInspection
    }

    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn params(&self) -> Value {
        encode_params(&self.params)
    }

    fn entity_type(&self) -> &'static str {
        "inspection"
    }

    fn entity_id(&self) -> String {
        self.params.inspection_id.clone()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let services = &ctx.services;
        ctx.breaker(Feature::DocumentExport)
            .call(|| {
                services.inspect_export(
                    &self.meta.tenant_id,
                    &self.params.inspection_id,
                    self.params.format.as_str(),
                )
            })
            .await
            .map_err(JobError::from_breaker)
    }

    async fn on_failure(&self, ctx: &JobContext, error: &JobError) {
        debug!(
            job_key = %ctx.job_key,
            inspection_id = %self.params.inspection_id,
            format = self.params.format.as_str(),
            error = %error,
            "Inspection export gave up"
        );
    }
}
