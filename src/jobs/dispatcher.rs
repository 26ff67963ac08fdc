//! # Job Dispatcher
//!
//! Entry point for submitting jobs. Every submission is checked against the
//! registry allowlist first. With a broker configured and reachable the job
//! is recorded as `pending` and handed off under the `JOB_QUEUE` circuit;
//! otherwise, or when the hand-off fails, it runs in the calling task. A job
//! is never dropped. Resubmitting a key that is still queued returns the
//! existing record instead of queuing it again.

use super::key_lock::KeyLocks;
use super::registry::{JobRegistry, RegistryError};
use super::runner::{JobRunOutcome, JobRunner};
use super::types::JobEnvelope;
use super::Job;
use crate::broker::{BrokerEnqueueRequest, BrokerError, BrokerJobStatus, JobBroker};
use crate::clock::{system_clock, SharedClock};
use crate::ledger::{
    JobExecutionRecord, JobFilter, JobStatus, LedgerError, NewJobExecution, StatusUpdate,
};
use crate::resilience::{CircuitBreakerError, CircuitBreakers, Feature};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a submission was handled
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to the broker
    Queued {
        record_id: Uuid,
        job_key: String,
        broker_job_id: String,
    },
    /// Ran in the calling task
    Executed(JobRunOutcome),
}

impl DispatchOutcome {
    pub fn job_key(&self) -> &str {
        match self {
            Self::Queued { job_key, .. } => job_key,
            Self::Executed(outcome) => outcome.job_key(),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn run_outcome(&self) -> Option<&JobRunOutcome> {
        match self {
            Self::Executed(outcome) => Some(outcome),
            Self::Queued { .. } => None,
        }
    }
}

/// Ledger record plus the broker's view, when there is one
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub record: JobExecutionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_status: Option<BrokerJobStatus>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job type not allowed: {identifier}")]
    NotAllowed { identifier: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("No job {job_key} for tenant {tenant_id}")]
    NotFound { tenant_id: String, job_key: String },

    #[error("Job {job_key} cannot be cancelled in status {status}")]
    NotCancellable { job_key: String, status: JobStatus },
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Routes jobs to the broker or the in-process runner
pub struct JobDispatcher {
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    broker: Option<Arc<dyn JobBroker>>,
    breakers: CircuitBreakers,
    clock: SharedClock,
    list_limit: u32,
    hand_off_locks: KeyLocks,
}

impl fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("registry", &self.registry)
            .field("broker", &self.broker.is_some())
            .field("list_limit", &self.list_limit)
            .finish()
    }
}

impl JobDispatcher {
    pub fn new(registry: Arc<JobRegistry>, runner: Arc<JobRunner>, breakers: CircuitBreakers) -> Self {
        Self {
            registry,
            runner,
            broker: None,
            breakers,
            clock: system_clock(),
            list_limit: 50,
            hand_off_locks: KeyLocks::new(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_list_limit(mut self, list_limit: u32) -> Self {
        self.list_limit = list_limit;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Submit a job
    pub async fn enqueue(&self, job: Box<dyn Job>) -> DispatchResult<DispatchOutcome> {
        let identifier = job.job_type().identifier();
        if !self.registry.is_job_allowed(identifier) {
            warn!(identifier = identifier, "🚫 Rejected job outside the allowlist");
            return Err(DispatchError::NotAllowed {
                identifier: identifier.to_string(),
            });
        }

        let job_key = job.job_key();
        let mut pending_record = None;

        if let Some(broker) = &self.broker {
            if broker.is_available().await {
                let key_lock = self.hand_off_locks.handle(&job.meta().tenant_id, &job_key);
                let handed_off = {
                    let _held = key_lock.lock().await;
                    self.hand_off(job.as_ref(), &job_key, broker.as_ref()).await
                };
                match handed_off {
                    Ok(outcome) => return Ok(outcome),
                    Err(HandOffFailure { record_id, reason }) => {
                        warn!(
                            job_key = %job_key,
                            reason = %reason,
                            "⚠️ Broker hand-off failed, running job in process"
                        );
                        pending_record = record_id;
                    }
                }
            } else {
                warn!(job_key = %job_key, "⚠️ Broker unavailable, running job in process");
            }
        }

        let outcome = self
            .runner
            .run_with_record(job.as_ref(), pending_record)
            .await;
        Ok(DispatchOutcome::Executed(outcome))
    }

    /// Submit a serialized job; it is rebuilt through the registry
    pub async fn enqueue_envelope(&self, envelope: JobEnvelope) -> DispatchResult<DispatchOutcome> {
        if !self.registry.is_job_allowed(&envelope.job_type) {
            warn!(identifier = %envelope.job_type, "🚫 Rejected job envelope outside the allowlist");
            return Err(DispatchError::NotAllowed {
                identifier: envelope.job_type,
            });
        }
        let job = self.registry.construct_envelope(&envelope)?;
        self.enqueue(job).await
    }

    async fn hand_off(
        &self,
        job: &dyn Job,
        job_key: &str,
        broker: &dyn JobBroker,
    ) -> Result<DispatchOutcome, HandOffFailure> {
        let meta = job.meta();
        let ledger = self.runner.ledger();

        match ledger.find_completed(&meta.tenant_id, job_key).await {
            Ok(Some(completed)) => {
                debug!(job_key = %job_key, "Job already completed, not handing off");
                return Ok(DispatchOutcome::Executed(JobRunOutcome::Skipped {
                    record_id: completed.id,
                    job_key: job_key.to_string(),
                    result: completed.result_summary,
                }));
            }
            Ok(None) => {}
            Err(e) => return Err(HandOffFailure::new(None, e.to_string())),
        }

        match ledger.find_latest(&meta.tenant_id, job_key).await {
            Ok(Some(latest)) if !latest.status.is_terminal() => {
                return match latest.broker_job_id {
                    Some(broker_job_id) => {
                        debug!(job_key = %job_key, record_id = %latest.id, "Job already queued, reusing its record");
                        Ok(DispatchOutcome::Queued {
                            record_id: latest.id,
                            job_key: job_key.to_string(),
                            broker_job_id,
                        })
                    }
                    // Running in process; the runner's key lock orders the rerun
                    None => Err(HandOffFailure::new(None, "job key is already running in process")),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(HandOffFailure::new(None, e.to_string())),
        }

        let policy = self.runner.policies().job_policy(job.job_type());
        let record = ledger
            .create(NewJobExecution {
                tenant_id: meta.tenant_id.clone(),
                job_key: job_key.to_string(),
                job_type: job.job_type().identifier().to_string(),
                status: JobStatus::Pending,
                attempt: 0,
                max_attempts: policy.max_attempts(),
                actor_user_id: meta.actor_user_id.clone(),
                request_id: meta.request_id.clone(),
                broker_job_id: None,
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| HandOffFailure::new(None, e.to_string()))?;

        let mut envelope = job.envelope();
        envelope.record_id = Some(record.id);
        let request = BrokerEnqueueRequest {
            callable_ref: envelope.job_type.clone(),
            args: envelope,
            job_id: job_key.to_string(),
            timeout_seconds: policy.timeout_seconds,
            max_retries: policy.max_retries,
        };

        let broker_job_id = self
            .breakers
            .breaker(Feature::JobQueue)
            .call(|| broker.enqueue(request))
            .await
            .map_err(|e| HandOffFailure::new(Some(record.id), describe_breaker_error(e)))?;

        if let Err(e) = ledger.attach_broker_job(record.id, &broker_job_id).await {
            warn!(record_id = %record.id, error = %e, "Failed to attach broker job id");
        }

        info!(
            job_key = %job_key,
            record_id = %record.id,
            broker_job_id = %broker_job_id,
            "📤 Job handed off to broker"
        );
        Ok(DispatchOutcome::Queued {
            record_id: record.id,
            job_key: job_key.to_string(),
            broker_job_id,
        })
    }

    /// The completed record if the key completed, otherwise the latest one
    async fn current_record(&self, tenant_id: &str, job_key: &str) -> DispatchResult<JobExecutionRecord> {
        let ledger = self.runner.ledger();
        if let Some(completed) = ledger.find_completed(tenant_id, job_key).await? {
            return Ok(completed);
        }
        ledger
            .find_latest(tenant_id, job_key)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                tenant_id: tenant_id.to_string(),
                job_key: job_key.to_string(),
            })
    }

    /// Current record for a key plus broker status
    pub async fn get_job_status(&self, tenant_id: &str, job_key: &str) -> DispatchResult<JobStatusView> {
        let record = self.current_record(tenant_id, job_key).await?;

        let broker_status = match (&self.broker, record.broker_job_id.as_deref()) {
            (Some(broker), Some(broker_job_id)) => match broker.fetch_status(broker_job_id).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(broker_job_id = %broker_job_id, error = %e, "Broker status unavailable");
                    None
                }
            },
            _ => None,
        };

        Ok(JobStatusView {
            record,
            broker_status,
        })
    }

    /// Cancel a job that has not started yet
    pub async fn cancel_job(&self, tenant_id: &str, job_key: &str) -> DispatchResult<JobExecutionRecord> {
        let ledger = self.runner.ledger();
        let record = self.current_record(tenant_id, job_key).await?;

        if !record.status.is_cancellable() {
            return Err(DispatchError::NotCancellable {
                job_key: job_key.to_string(),
                status: record.status,
            });
        }

        if let (Some(broker), Some(broker_job_id)) = (&self.broker, record.broker_job_id.as_deref()) {
            match broker.cancel(broker_job_id).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(DispatchError::NotCancellable {
                        job_key: job_key.to_string(),
                        status: JobStatus::Processing,
                    })
                }
                Err(BrokerError::NotFound { .. }) => {}
                Err(e) => warn!(broker_job_id = %broker_job_id, error = %e, "Broker cancel failed"),
            }
        }

        let cancelled = ledger
            .update_status(
                record.id,
                StatusUpdate::cancelled("cancelled by request", self.clock.now()),
            )
            .await?;
        info!(job_key = %job_key, record_id = %record.id, "🛑 Job cancelled");
        Ok(cancelled)
    }

    /// Recent records for a tenant, newest first
    pub async fn list_jobs(&self, tenant_id: &str, filter: &JobFilter) -> DispatchResult<Vec<JobExecutionRecord>> {
        Ok(self
            .runner
            .ledger()
            .list_recent(tenant_id, filter, self.list_limit)
            .await?)
    }
}

struct HandOffFailure {
    record_id: Option<Uuid>,
    reason: String,
}

impl HandOffFailure {
    fn new(record_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self {
            record_id,
            reason: reason.into(),
        }
    }
}

fn describe_breaker_error(error: CircuitBreakerError<BrokerError>) -> String {
    match error {
        CircuitBreakerError::CircuitOpen(fallback) => {
            format!("job queue circuit {}: {}", fallback.circuit_state, fallback.message)
        }
        CircuitBreakerError::OperationFailed(e) => e.to_string(),
    }
}
