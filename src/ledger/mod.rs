//! # Idempotency Ledger
//!
//! Durable record of job executions keyed by `(tenant_id, job_key)`. The
//! ledger is the cross-process authority for "already completed": at most one
//! record per key may ever reach [`JobStatus::Completed`], and backends must
//! enforce that atomically (the PostgreSQL backend with a partial unique
//! index, the in-memory backend under its lock).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PgExecutionLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of one job execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded by the dispatcher, waiting for a worker
    Pending,
    /// An attempt is running
    Processing,
    /// Finished successfully; terminal and unique per key
    Completed,
    /// All attempts exhausted or a permanent error; terminal
    Failed,
    /// Waiting for the next attempt
    Retrying,
    /// Cancelled before it started; terminal
    Cancelled,
}

impl JobStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the record can still be cancelled
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this is an active state (an attempt is running or scheduled)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// One job execution, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub job_key: String,
    pub job_type: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<Value>,
    pub actor_user_id: Option<String>,
    pub request_id: Option<String>,
    pub broker_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a record
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobExecution {
    pub tenant_id: String,
    pub job_key: String,
    pub job_type: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub actor_user_id: Option<String>,
    pub request_id: Option<String>,
    pub broker_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A status change plus whatever the change carries
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub attempt: Option<u32>,
    pub error_message: Option<String>,
    pub result_summary: Option<Value>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn processing(attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Processing,
            attempt: Some(attempt),
            error_message: None,
            result_summary: None,
            at,
        }
    }

    pub fn retrying(attempt: u32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Retrying,
            attempt: Some(attempt),
            error_message: Some(error.into()),
            result_summary: None,
            at,
        }
    }

    pub fn completed(result_summary: Value, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Completed,
            attempt: None,
            error_message: None,
            result_summary: Some(result_summary),
            at,
        }
    }

    pub fn failed(attempt: u32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Failed,
            attempt: Some(attempt),
            error_message: Some(error.into()),
            result_summary: None,
            at,
        }
    }

    pub fn cancelled(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Cancelled,
            attempt: None,
            error_message: Some(reason.into()),
            result_summary: None,
            at,
        }
    }
}

/// Filters for [`ExecutionLedger::list_recent`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, record: &JobExecutionRecord) -> bool {
        self.status.map_or(true, |status| record.status == status)
            && self
                .job_type
                .as_deref()
                .map_or(true, |job_type| record.job_type == job_type)
            && self.since.map_or(true, |since| record.created_at >= since)
    }
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Job execution record not found: {id}")]
    NotFound { id: Uuid },

    #[error("Job {job_key} already completed for tenant {tenant_id}")]
    AlreadyCompleted { tenant_id: String, job_key: String },

    #[error("Invalid status transition for record {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Ledger storage error: {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl LedgerError {
    pub fn storage(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Persistence contract for job execution records
#[async_trait]
pub trait ExecutionLedger: Send + Sync + fmt::Debug {
    /// The completed record for the key, if any
    async fn find_completed(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>>;

    /// Most recently created record for the key
    async fn find_latest(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>>;

    async fn get(&self, id: Uuid) -> LedgerResult<Option<JobExecutionRecord>>;

    async fn create(&self, record: NewJobExecution) -> LedgerResult<JobExecutionRecord>;

    /// Apply a status change; terminal records reject further changes and a
    /// second completion for the same key fails with `AlreadyCompleted`
    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> LedgerResult<JobExecutionRecord>;

    async fn attach_broker_job(&self, id: Uuid, broker_job_id: &str) -> LedgerResult<()>;

    /// Newest first
    async fn list_recent(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: u32,
    ) -> LedgerResult<Vec<JobExecutionRecord>>;
}

/// Shared checks for status updates, used by every backend
pub(crate) fn check_transition(
    record: &JobExecutionRecord,
    update: &StatusUpdate,
) -> LedgerResult<()> {
    if record.status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: record.id,
            from: record.status,
            to: update.status,
        });
    }
    Ok(())
}

/// Apply an update to an in-memory copy of a record
pub(crate) fn apply_update(record: &mut JobExecutionRecord, update: StatusUpdate) {
    record.status = update.status;
    if let Some(attempt) = update.attempt {
        record.attempt = attempt;
    }
    if update.status == JobStatus::Processing && record.started_at.is_none() {
        record.started_at = Some(update.at);
    }
    if update.status.is_terminal() {
        record.completed_at = Some(update.at);
    }
    if update.error_message.is_some() {
        record.error_message = update.error_message;
    }
    if update.result_summary.is_some() {
        record.result_summary = update.result_summary;
    }
    record.updated_at = update.at;
}
