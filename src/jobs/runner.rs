//! # Job Runner
//!
//! Idempotent, retrying, timeout-bounded execution of one [`Job`].
//!
//! ```text
//! Pending → Processing → Completed
//!                      ↘ Retrying → Processing (loop)
//!                      ↘ Failed
//! ```
//!
//! The ledger is consulted first: a key that already reached `Completed`
//! is skipped without calling `execute`. Attempts for one
//! `(tenant_id, job_key)` are strictly sequential; the runner holds a
//! per-key async lock for the whole run. A run never returns an error: every
//! failure ends as [`JobRunOutcome::Failed`].

use super::errors::{JobError, RetryDecision};
use super::job::{DomainServices, Job, JobContext};
use super::key_lock::KeyLocks;
use crate::audit::{AuditEvent, AuditSink};
use crate::clock::{system_clock, SharedClock};
use crate::config::RunnerSettings;
use crate::ledger::{
    ExecutionLedger, JobExecutionRecord, JobStatus, LedgerError, NewJobExecution, StatusUpdate,
};
use crate::logging::{log_error, log_job_operation};
use crate::policy::{JobPolicy, PolicyRegistry};
use crate::resilience::{Backoff, CircuitBreakers};
use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final result of one run; never an `Err`
#[derive(Debug, Clone, PartialEq)]
pub enum JobRunOutcome {
    Completed {
        record_id: Uuid,
        job_key: String,
        attempts: u32,
        result: Value,
    },
    /// The key had already completed; `execute` was not called
    Skipped {
        record_id: Uuid,
        job_key: String,
        result: Option<Value>,
    },
    Failed {
        record_id: Option<Uuid>,
        job_key: String,
        attempts: u32,
        error: JobError,
    },
    Cancelled {
        record_id: Uuid,
        job_key: String,
        reason: String,
    },
}

impl JobRunOutcome {
    pub fn job_key(&self) -> &str {
        match self {
            Self::Completed { job_key, .. }
            | Self::Skipped { job_key, .. }
            | Self::Failed { job_key, .. }
            | Self::Cancelled { job_key, .. } => job_key,
        }
    }

    pub fn record_id(&self) -> Option<Uuid> {
        match self {
            Self::Completed { record_id, .. }
            | Self::Skipped { record_id, .. }
            | Self::Cancelled { record_id, .. } => Some(*record_id),
            Self::Failed { record_id, .. } => *record_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } | Self::Skipped { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    /// Response body for hosts; skipped runs carry `skipped: true`
    pub fn to_json(&self) -> Value {
        match self {
            Self::Completed {
                record_id,
                job_key,
                attempts,
                result,
            } => json!({
                "status": "completed",
                "record_id": record_id,
                "job_key": job_key,
                "attempts": attempts,
                "result": result,
            }),
            Self::Skipped {
                record_id,
                job_key,
                result,
            } => json!({
                "status": "completed",
                "skipped": true,
                "record_id": record_id,
                "job_key": job_key,
                "result": result,
            }),
            Self::Failed {
                record_id,
                job_key,
                attempts,
                error,
            } => json!({
                "status": "failed",
                "record_id": record_id,
                "job_key": job_key,
                "attempts": attempts,
                "error": error.message,
                "error_kind": error.kind,
                "error_code": error.code,
            }),
            Self::Cancelled {
                record_id,
                job_key,
                reason,
            } => json!({
                "status": "cancelled",
                "record_id": record_id,
                "job_key": job_key,
                "reason": reason,
            }),
        }
    }
}

/// Executes jobs against the ledger, audit sink and domain services
pub struct JobRunner {
    ledger: Arc<dyn ExecutionLedger>,
    audit: Arc<dyn AuditSink>,
    services: Arc<dyn DomainServices>,
    breakers: CircuitBreakers,
    policies: Arc<PolicyRegistry>,
    clock: SharedClock,
    settings: RunnerSettings,
    key_locks: KeyLocks,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("settings", &self.settings)
            .field("active_keys", &self.key_locks.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        ledger: Arc<dyn ExecutionLedger>,
        audit: Arc<dyn AuditSink>,
        services: Arc<dyn DomainServices>,
        breakers: CircuitBreakers,
    ) -> Self {
        let policies = breakers.policies().clone();
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger,
            audit,
            services,
            breakers,
            policies,
            clock: system_clock(),
            settings: RunnerSettings::default(),
            key_locks: KeyLocks::new(),
            shutdown,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.ledger
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    /// Signal shutdown; runs waiting in a backoff end as cancelled
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run a job, creating its ledger record
    pub async fn run(&self, job: &dyn Job) -> JobRunOutcome {
        self.run_with_record(job, None).await
    }

    /// Run a job, advancing a record the dispatcher created beforehand
    pub async fn run_with_record(&self, job: &dyn Job, record_id: Option<Uuid>) -> JobRunOutcome {
        let job_key = job.job_key();
        let key_lock = self.key_locks.handle(&job.meta().tenant_id, &job_key);
        let _held = key_lock.lock().await;
        let outcome = self.run_locked(job, &job_key, record_id).await;
        outcome
    }

    /// Keys with a run in progress or waiting for one
    pub fn active_key_locks(&self) -> usize {
        self.key_locks.len()
    }

    async fn run_locked(
        &self,
        job: &dyn Job,
        job_key: &str,
        record_id: Option<Uuid>,
    ) -> JobRunOutcome {
        let meta = job.meta();
        let job_type = job.job_type();
        let policy = self.policies.job_policy(job_type);

        // 1. Idempotency check
        match self.ledger.find_completed(&meta.tenant_id, job_key).await {
            Ok(Some(completed)) => {
                log_job_operation(
                    "skip",
                    &meta.tenant_id,
                    job_key,
                    job_type.identifier(),
                    None,
                    "skipped",
                    Some("already completed"),
                );
                if let Some(id) = record_id {
                    self.retire_duplicate(id).await;
                }
                return JobRunOutcome::Skipped {
                    record_id: completed.id,
                    job_key: job_key.to_string(),
                    result: completed.result_summary,
                };
            }
            Ok(None) => {}
            Err(e) => return self.ledger_unavailable(job, job_key, "find_completed", e),
        }

        // 2. Create or advance the record
        let record = match self.begin_record(job, job_key, &policy, record_id).await {
            Ok(record) => record,
            Err(e) => return self.ledger_unavailable(job, job_key, "create", e),
        };
        if record.status == JobStatus::Cancelled {
            info!(job_key = %job_key, record_id = %record.id, "Job was cancelled before it started");
            return JobRunOutcome::Cancelled {
                record_id: record.id,
                job_key: job_key.to_string(),
                reason: record
                    .error_message
                    .unwrap_or_else(|| "cancelled before start".to_string()),
            };
        }
        let record_id = record.id;

        // 3. Started
        self.audit(
            job,
            &policy,
            "started",
            json!({"job_key": job_key, "record_id": record_id}),
        )
        .await;

        // 4. Attempts
        let max_attempts = policy.max_attempts();
        let backoff = policy.backoff_strategy();
        let mut attempt = 1;
        let last_error = loop {
            if attempt > 1 {
                self.update_record(record_id, StatusUpdate::processing(attempt, self.clock.now()))
                    .await;
            }
            log_job_operation(
                "execute",
                &meta.tenant_id,
                job_key,
                job_type.identifier(),
                Some(attempt),
                "processing",
                None,
            );

            let ctx = self.context(job, job_key, attempt, max_attempts);
            match self.execute_attempt(job, &ctx, policy.timeout()).await {
                Ok(result) => return self.complete(job, &ctx, &policy, record_id, result).await,
                Err(error) => {
                    let decision = RetryDecision::decide(
                        error.kind,
                        attempt,
                        max_attempts,
                        self.settings.unclassified_errors,
                    );
                    if decision == RetryDecision::GiveUp {
                        break error;
                    }

                    warn!(
                        job_key = %job_key,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error_kind = %error.kind,
                        error = %error,
                        "🔁 Job attempt failed, retrying"
                    );
                    self.update_record(
                        record_id,
                        StatusUpdate::retrying(attempt, &error.message, self.clock.now()),
                    )
                    .await;
                    job.on_retry(&ctx, &error, attempt + 1).await;

                    if !self.wait_or_shutdown(backoff.delay_for(attempt)).await {
                        self.update_record(
                            record_id,
                            StatusUpdate::cancelled("shutdown during retry backoff", self.clock.now()),
                        )
                        .await;
                        return JobRunOutcome::Cancelled {
                            record_id,
                            job_key: job_key.to_string(),
                            reason: "shutdown during retry backoff".to_string(),
                        };
                    }
                    attempt += 1;
                }
            }
        };

        // 5. Give up
        self.fail(job, job_key, &policy, record_id, attempt, last_error)
            .await
    }

    async fn begin_record(
        &self,
        job: &dyn Job,
        job_key: &str,
        policy: &JobPolicy,
        record_id: Option<Uuid>,
    ) -> Result<JobExecutionRecord, LedgerError> {
        let now = self.clock.now();

        if let Some(id) = record_id {
            if let Some(existing) = self.ledger.get(id).await? {
                match existing.status {
                    JobStatus::Cancelled => return Ok(existing),
                    status if !status.is_terminal() => {
                        return self
                            .ledger
                            .update_status(id, StatusUpdate::processing(1, now))
                            .await;
                    }
                    _ => {
                        debug!(record_id = %id, status = %existing.status, "Pre-created record is terminal, starting a new one");
                    }
                }
            }
        }

        let meta = job.meta();
        self.ledger
            .create(NewJobExecution {
                tenant_id: meta.tenant_id.clone(),
                job_key: job_key.to_string(),
                job_type: job.job_type().identifier().to_string(),
                status: JobStatus::Processing,
                attempt: 1,
                max_attempts: policy.max_attempts(),
                actor_user_id: meta.actor_user_id.clone(),
                request_id: meta.request_id.clone(),
                broker_job_id: None,
                created_at: now,
            })
            .await
    }

    fn context(&self, job: &dyn Job, job_key: &str, attempt: u32, max_attempts: u32) -> JobContext {
        JobContext {
            meta: job.meta().clone(),
            job_key: job_key.to_string(),
            attempt,
            max_attempts,
            services: self.services.clone(),
            breakers: self.breakers.clone(),
        }
    }

    /// One attempt bounded by `timeout`; panics become `Fatal` errors
    async fn execute_attempt(
        &self,
        job: &dyn Job,
        ctx: &JobContext,
        timeout: Duration,
    ) -> Result<Value, JobError> {
        let attempt = AssertUnwindSafe(job.execute(ctx)).catch_unwind();
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(JobError::panicked(&panic_message(panic.as_ref()))),
            Err(_) => Err(JobError::timed_out(timeout)),
        }
    }

    async fn complete(
        &self,
        job: &dyn Job,
        ctx: &JobContext,
        policy: &JobPolicy,
        record_id: Uuid,
        result: Value,
    ) -> JobRunOutcome {
        let now = self.clock.now();
        match self
            .ledger
            .update_status(record_id, StatusUpdate::completed(result.clone(), now))
            .await
        {
            Ok(_) => {}
            Err(LedgerError::AlreadyCompleted { .. }) => {
                // Another process won the completion race
                warn!(job_key = %ctx.job_key, record_id = %record_id, "Job completed concurrently elsewhere, reporting skipped");
                self.update_record(
                    record_id,
                    StatusUpdate::cancelled("completed elsewhere", self.clock.now()),
                )
                .await;
                let winner = self
                    .ledger
                    .find_completed(&ctx.meta.tenant_id, &ctx.job_key)
                    .await
                    .ok()
                    .flatten();
                return match winner {
                    Some(winner) => JobRunOutcome::Skipped {
                        record_id: winner.id,
                        job_key: ctx.job_key.clone(),
                        result: winner.result_summary,
                    },
                    None => JobRunOutcome::Skipped {
                        record_id,
                        job_key: ctx.job_key.clone(),
                        result: Some(result),
                    },
                };
            }
            Err(e) => {
                log_error("job_runner", "complete", &e.to_string(), Some(&ctx.job_key));
                let error = JobError::fatal(format!("Job result could not be recorded: {e}"))
                    .with_code("LEDGER_UNAVAILABLE");
                return self
                    .fail(job, &ctx.job_key, policy, record_id, ctx.attempt, error)
                    .await;
            }
        }

        job.on_success(ctx, &result).await;
        log_job_operation(
            "complete",
            &ctx.meta.tenant_id,
            &ctx.job_key,
            job.job_type().identifier(),
            Some(ctx.attempt),
            "completed",
            None,
        );
        self.audit(
            job,
            policy,
            "completed",
            json!({"job_key": ctx.job_key, "record_id": record_id, "attempts": ctx.attempt}),
        )
        .await;

        JobRunOutcome::Completed {
            record_id,
            job_key: ctx.job_key.clone(),
            attempts: ctx.attempt,
            result,
        }
    }

    async fn fail(
        &self,
        job: &dyn Job,
        job_key: &str,
        policy: &JobPolicy,
        record_id: Uuid,
        attempts: u32,
        error: JobError,
    ) -> JobRunOutcome {
        self.update_record(
            record_id,
            StatusUpdate::failed(attempts, &error.message, self.clock.now()),
        )
        .await;

        let ctx = self.context(job, job_key, attempts, policy.max_attempts());
        job.on_failure(&ctx, &error).await;

        log_job_operation(
            "fail",
            &job.meta().tenant_id,
            job_key,
            job.job_type().identifier(),
            Some(attempts),
            "failed",
            Some(&error.message),
        );
        self.audit(
            job,
            policy,
            "failed",
            json!({
                "job_key": job_key,
                "record_id": record_id,
                "attempts": attempts,
                "error": error.message,
                "error_kind": error.kind,
            }),
        )
        .await;

        JobRunOutcome::Failed {
            record_id: Some(record_id),
            job_key: job_key.to_string(),
            attempts,
            error,
        }
    }

    fn ledger_unavailable(
        &self,
        job: &dyn Job,
        job_key: &str,
        operation: &str,
        error: LedgerError,
    ) -> JobRunOutcome {
        log_error("job_runner", operation, &error.to_string(), Some(job_key));
        JobRunOutcome::Failed {
            record_id: None,
            job_key: job_key.to_string(),
            attempts: 0,
            error: JobError::fatal(format!(
                "Execution ledger unavailable for {}: {error}",
                job.job_type()
            ))
            .with_code("LEDGER_UNAVAILABLE"),
        }
    }

    /// Cancel a pre-created record whose key completed before it ran
    async fn retire_duplicate(&self, record_id: Uuid) {
        match self.ledger.get(record_id).await {
            Ok(Some(record)) if !record.status.is_terminal() => {
                self.update_record(
                    record_id,
                    StatusUpdate::cancelled("job key already completed", self.clock.now()),
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => warn!(record_id = %record_id, error = %e, "Failed to load pre-created record"),
        }
    }

    /// Status writes after the record exists are logged, not fatal
    async fn update_record(&self, record_id: Uuid, update: StatusUpdate) {
        let status = update.status;
        if let Err(e) = self.ledger.update_status(record_id, update).await {
            warn!(
                record_id = %record_id,
                status = %status,
                error = %e,
                "Failed to update job execution record"
            );
        }
    }

    /// False when shutdown was signalled before the delay elapsed
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }

    async fn audit(&self, job: &dyn Job, policy: &JobPolicy, lifecycle: &str, mut metadata: Value) {
        let meta = job.meta();
        if let Value::Object(map) = &mut metadata {
            map.insert("lifecycle".to_string(), json!(lifecycle));
            map.insert("job_type".to_string(), json!(job.job_type().identifier()));
            map.insert("request_id".to_string(), json!(meta.request_id));
        }
        let event = AuditEvent::new(
            meta.tenant_id.clone(),
            policy.audit_action.clone(),
            job.entity_type(),
            job.entity_id(),
            format!("Job {lifecycle}: {}", job.job_type()),
        )
        .with_actor(meta.actor_user_id.clone())
        .with_metadata(metadata);

        match tokio::time::timeout(self.settings.audit_timeout(), self.audit.log_action(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(lifecycle = lifecycle, error = %e, "Audit sink rejected job event"),
            Err(_) => warn!(
                lifecycle = lifecycle,
                timeout_ms = self.settings.audit_timeout_ms,
                "Audit sink timed out"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_outcome_json_flags_skip() {
        let outcome = JobRunOutcome::Skipped {
            record_id: Uuid::nil(),
            job_key: "ai_insight:abc".to_string(),
            result: None,
        };
        let body = outcome.to_json();
        assert_eq!(body["skipped"], true);
        assert_eq!(body["status"], "completed");
        assert!(outcome.is_skipped());
        assert_eq!(outcome.status(), JobStatus::Completed);
    }

    #[test]
    fn test_failed_outcome_json_carries_error() {
        let outcome = JobRunOutcome::Failed {
            record_id: None,
            job_key: "k".to_string(),
            attempts: 3,
            error: JobError::timed_out(Duration::from_secs(5)),
        };
        let body = outcome.to_json();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["attempts"], 3);
        assert_eq!(body["error_kind"], "retryable");
        assert!(body["error"].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
