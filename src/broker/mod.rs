//! # Job Broker
//!
//! Contract for handing jobs to an asynchronous execution backend. The
//! dispatcher uses the job key as the broker-level idempotency id, so a
//! broker that already holds a live entry for that id must not queue a
//! second one.

pub mod local;

pub use local::{BrokerMessage, BrokerWorker, InProcessBroker};

use crate::jobs::JobEnvelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One hand-off to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnqueueRequest {
    /// Registry identifier the worker resolves, e.g. `ai_insight`
    pub callable_ref: String,
    pub args: JobEnvelope,
    /// Broker-level idempotency id (the job key)
    pub job_id: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerJobState {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl BrokerJobState {
    /// Queued or running
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for BrokerJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Broker-side view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJobStatus {
    pub broker_job_id: String,
    pub callable_ref: String,
    pub state: BrokerJobState,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Broker queue full: capacity {capacity}")]
    QueueFull { capacity: usize },

    #[error("Broker job not found: {broker_job_id}")]
    NotFound { broker_job_id: String },

    #[error("Broker worker already started")]
    WorkerAlreadyStarted,
}

impl BrokerError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn not_found(broker_job_id: impl Into<String>) -> Self {
        Self::NotFound {
            broker_job_id: broker_job_id.into(),
        }
    }
}

/// Asynchronous execution backend
#[async_trait]
pub trait JobBroker: Send + Sync + fmt::Debug {
    /// Queue a job; returns the broker job id
    async fn enqueue(&self, request: BrokerEnqueueRequest) -> Result<String, BrokerError>;

    async fn fetch_status(&self, broker_job_id: &str)
        -> Result<Option<BrokerJobStatus>, BrokerError>;

    /// Cancel a queued job; `false` when it already started or finished
    async fn cancel(&self, broker_job_id: &str) -> Result<bool, BrokerError>;

    async fn is_available(&self) -> bool;
}
