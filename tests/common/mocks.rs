//! Mock collaborators: audit sinks, domain services and scripted jobs.

use async_trait::async_trait;
use campus_core::audit::{AuditError, AuditEvent, AuditSink};
use campus_core::jobs::{DomainServices, Job, JobContext, JobError, JobMeta, JobType};
use campus_core::ledger::{ExecutionLedger, JobStatus, NewJobExecution, StatusUpdate};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Lifecycle labels in the order they were logged
    pub fn lifecycles(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| event.metadata["lifecycle"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn log_action(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Rejects every event
#[derive(Debug, Default)]
pub struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn log_action(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::unavailable("audit database offline"))
    }
}

/// Never answers within any reasonable timeout
#[derive(Debug, Default)]
pub struct HangingAuditSink;

#[async_trait]
impl AuditSink for HangingAuditSink {
    async fn log_action(&self, _event: AuditEvent) -> Result<(), AuditError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(())
    }
}

/// Domain services answering from a script, then with a canned success
#[derive(Debug, Default)]
pub struct StubDomainServices {
    insight_script: Mutex<VecDeque<Result<Value, JobError>>>,
    insight_calls: AtomicU32,
    snapshot_calls: AtomicU32,
    export_calls: AtomicU32,
}

impl StubDomainServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the results of the next `generate_insight` calls
    pub fn script_insights(self, results: Vec<Result<Value, JobError>>) -> Self {
        self.insight_script.lock().extend(results);
        self
    }

    pub fn insight_calls(&self) -> u32 {
        self.insight_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn export_calls(&self) -> u32 {
        self.export_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainServices for StubDomainServices {
    async fn generate_insight(
        &self,
        _tenant_id: &str,
        student_id: &str,
        term: &str,
    ) -> Result<Value, JobError> {
        self.insight_calls.fetch_add(1, Ordering::SeqCst);
        self.insight_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"student_id": student_id, "term": term, "insights": 3})))
    }

    async fn build_analytics_snapshot(
        &self,
        _tenant_id: &str,
        snapshot_date: NaiveDate,
    ) -> Result<Value, JobError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"snapshot_date": snapshot_date, "rows": 120}))
    }

    async fn inspect_export(
        &self,
        _tenant_id: &str,
        inspection_id: &str,
        format: &str,
    ) -> Result<Value, JobError> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"inspection_id": inspection_id, "format": format, "pages": 4}))
    }
}

/// What a [`ScriptedJob`] does on each attempt
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Value),
    /// Fail the first `n` attempts with the error, then succeed
    FailTimes(u32, JobError),
    AlwaysFail(JobError),
    /// Sleep, then succeed
    Sleep(Duration),
    Panic(&'static str),
    /// Another worker completes the same key while this attempt runs
    CompletedElsewhere(Arc<dyn ExecutionLedger>),
}

/// Job whose attempts follow a fixed [`Behavior`]; records calls and hooks
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    meta: JobMeta,
    params: Value,
    behavior: Behavior,
    calls: Arc<AtomicU32>,
    hooks: Arc<Mutex<Vec<String>>>,
}

impl ScriptedJob {
    pub fn new(tenant_id: &str, student_id: &str, behavior: Behavior) -> Self {
        Self {
            meta: JobMeta::new(tenant_id).with_actor("user-7"),
            params: json!({"student_id": student_id, "term": "2026-T1"}),
            behavior,
            calls: Arc::new(AtomicU32::new(0)),
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hooks(&self) -> Vec<String> {
        self.hooks.lock().clone()
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn job_type(&self) -> JobType {
        JobType::AiInsight
    }

    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn params(&self) -> Value {
        self.params.clone()
    }

    fn entity_type(&self) -> &'static str {
        "student"
    }

    fn entity_id(&self) -> String {
        self.params["student_id"].as_str().unwrap_or_default().to_string()
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            Behavior::Succeed(value) => Ok(value.clone()),
            Behavior::FailTimes(failures, error) if call <= *failures => Err(error.clone()),
            Behavior::FailTimes(..) => Ok(json!({"attempt": ctx.attempt})),
            Behavior::AlwaysFail(error) => Err(error.clone()),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(json!({"slept_ms": duration.as_millis() as u64}))
            }
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::CompletedElsewhere(ledger) => {
                let now = Utc::now();
                let other = ledger
                    .create(NewJobExecution {
                        tenant_id: ctx.meta.tenant_id.clone(),
                        job_key: ctx.job_key.clone(),
                        job_type: self.job_type().identifier().to_string(),
                        status: JobStatus::Processing,
                        attempt: 1,
                        max_attempts: ctx.max_attempts,
                        actor_user_id: None,
                        request_id: None,
                        broker_job_id: None,
                        created_at: now,
                    })
                    .await
                    .map_err(|e| JobError::fatal(e.to_string()))?;
                ledger
                    .update_status(other.id, StatusUpdate::completed(json!({"by": "other"}), now))
                    .await
                    .map_err(|e| JobError::fatal(e.to_string()))?;
                Ok(json!({"by": "this"}))
            }
        }
    }

    async fn on_success(&self, _ctx: &JobContext, _result: &Value) {
        self.hooks.lock().push("success".to_string());
    }

    async fn on_failure(&self, _ctx: &JobContext, error: &JobError) {
        self.hooks.lock().push(format!("failure:{}", error.kind));
    }

    async fn on_retry(&self, _ctx: &JobContext, _error: &JobError, next_attempt: u32) {
        self.hooks.lock().push(format!("retry:{next_attempt}"));
    }
}
