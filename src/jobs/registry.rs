//! # Job Registry
//!
//! Explicit allowlist mapping job identifiers to constructors. Nothing is
//! resolved by name at runtime beyond this table: the dispatcher checks
//! [`JobRegistry::is_job_allowed`] before any hand-off, and broker workers
//! rebuild jobs from envelopes only through [`JobRegistry::construct`].

use super::builtin::{AiInsightJob, AnalyticsSnapshotJob, ExportInspectionJob};
use super::errors::JobError;
use super::job::Job;
use super::types::{JobEnvelope, JobMeta, JobType};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Builds a job from its metadata and serialized parameters
pub type JobConstructor = fn(JobMeta, Value) -> Result<Box<dyn Job>, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job type not allowed: {identifier}")]
    NotAllowed { identifier: String },

    #[error("Invalid parameters for {identifier}: {source}")]
    InvalidParams {
        identifier: String,
        #[source]
        source: JobError,
    },
}

impl RegistryError {
    pub fn not_allowed(identifier: impl Into<String>) -> Self {
        Self::NotAllowed {
            identifier: identifier.into(),
        }
    }

    pub fn invalid_params(identifier: impl Into<String>, source: JobError) -> Self {
        Self::InvalidParams {
            identifier: identifier.into(),
            source,
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_jobs: usize,
    pub identifiers: Vec<String>,
}

/// Allowlist of constructible jobs
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: BTreeMap<String, JobConstructor>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("identifiers", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn build_ai_insight(meta: JobMeta, params: Value) -> Result<Box<dyn Job>, RegistryError> {
    AiInsightJob::from_value(meta, params)
        .map(|job| Box::new(job) as Box<dyn Job>)
        .map_err(|e| RegistryError::invalid_params(JobType::AiInsight.identifier(), e))
}

fn build_analytics_snapshot(meta: JobMeta, params: Value) -> Result<Box<dyn Job>, RegistryError> {
    AnalyticsSnapshotJob::from_value(meta, params)
        .map(|job| Box::new(job) as Box<dyn Job>)
        .map_err(|e| RegistryError::invalid_params(JobType::AnalyticsSnapshot.identifier(), e))
}

fn build_export_inspection(meta: JobMeta, params: Value) -> Result<Box<dyn Job>, RegistryError> {
    ExportInspectionJob::from_value(meta, params)
        .map(|job| Box::new(job) as Box<dyn Job>)
        .map_err(|e| RegistryError::invalid_params(JobType::ExportInspection.identifier(), e))
}

impl JobRegistry {
    /// An empty registry; nothing is allowed
    pub fn empty() -> Self {
        Self::default()
    }

    /// The platform's registration point for every built-in job type
    pub fn builtin() -> Self {
        Self::empty()
            .register(JobType::AiInsight, build_ai_insight)
            .register(JobType::AnalyticsSnapshot, build_analytics_snapshot)
            .register(JobType::ExportInspection, build_export_inspection)
    }

    /// Add a job type to the allowlist
    pub fn register(mut self, job_type: JobType, constructor: JobConstructor) -> Self {
        info!(
            identifier = job_type.identifier(),
            "✅ Registered job type in allowlist"
        );
        self.constructors
            .insert(job_type.identifier().to_string(), constructor);
        self
    }

    pub fn is_job_allowed(&self, identifier: &str) -> bool {
        self.constructors.contains_key(identifier)
    }

    /// Construct a job by identifier
    pub fn construct(
        &self,
        identifier: &str,
        meta: JobMeta,
        params: Value,
    ) -> Result<Box<dyn Job>, RegistryError> {
        let constructor = self
            .constructors
            .get(identifier)
            .ok_or_else(|| RegistryError::not_allowed(identifier))?;
        constructor(meta, params)
    }

    /// Rebuild a job from its serialized envelope
    pub fn construct_envelope(&self, envelope: &JobEnvelope) -> Result<Box<dyn Job>, RegistryError> {
        self.construct(
            &envelope.job_type,
            envelope.meta.clone(),
            envelope.params.clone(),
        )
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_jobs: self.constructors.len(),
            identifiers: self.constructors.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_allowlist() {
        let registry = JobRegistry::builtin();
        for job_type in JobType::ALL {
            assert!(registry.is_job_allowed(job_type.identifier()));
        }
        assert!(!registry.is_job_allowed("delete_everything"));
        assert!(!JobRegistry::empty().is_job_allowed("ai_insight"));
        assert_eq!(registry.stats().total_jobs, 3);
    }

    #[test]
    fn test_construct_rejects_unknown_and_invalid() {
        let registry = JobRegistry::builtin();

        let result = registry.construct("shell_exec", JobMeta::new("t1"), json!({}));
        assert!(matches!(result, Err(RegistryError::NotAllowed { .. })));

        let result = registry.construct("ai_insight", JobMeta::new("t1"), json!({"term": 3}));
        assert!(matches!(result, Err(RegistryError::InvalidParams { .. })));
    }

    #[test]
    fn test_construct_envelope_round_trip() {
        let registry = JobRegistry::builtin();
        let job = registry
            .construct(
                "ai_insight",
                JobMeta::new("t1"),
                json!({"student_id": "s-1", "term": "2026-T1"}),
            )
            .unwrap();

        let rebuilt = registry.construct_envelope(&job.envelope()).unwrap();
        assert_eq!(rebuilt.job_key(), job.job_key());
        assert_eq!(rebuilt.job_type(), JobType::AiInsight);
    }
}
