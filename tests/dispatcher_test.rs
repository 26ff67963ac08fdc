//! Dispatcher integration tests: allowlist, broker hand-off and fallback

mod common;

use campus_core::broker::{BrokerJobState, BrokerJobStatus, BrokerWorker, InProcessBroker};
use campus_core::config::ConfigManager;
use campus_core::core::ResilienceCore;
use campus_core::jobs::{
    DispatchError, DispatchOutcome, Job, JobDispatcher, JobEnvelope, JobError, JobMeta,
    JobRegistry, JobRunOutcome, JobType, RegistryError,
};
use campus_core::ledger::{ExecutionLedger, JobFilter, JobStatus, NewJobExecution};
use campus_core::resilience::{CircuitState, Feature};
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_status(
    dispatcher: &JobDispatcher,
    tenant_id: &str,
    job_key: &str,
    status: JobStatus,
) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(view) = dispatcher.get_job_status(tenant_id, job_key).await {
                if view.record.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "job {job_key} never reached {status}");
}

fn spawn_worker(harness: &Harness, broker: &Arc<InProcessBroker>) -> tokio::task::JoinHandle<()> {
    BrokerWorker::new(
        broker.clone(),
        Arc::new(JobRegistry::builtin()),
        harness.runner.clone(),
        2,
    )
    .spawn()
    .unwrap()
}

#[tokio::test]
async fn test_envelope_outside_allowlist_is_rejected() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);

    let result = dispatcher
        .enqueue_envelope(JobEnvelope {
            job_type: "std::process::Command".to_string(),
            meta: JobMeta::new("tenant-1"),
            params: json!({"program": "rm"}),
            record_id: None,
        })
        .await;

    assert!(matches!(result, Err(DispatchError::NotAllowed { .. })));
    assert!(harness.ledger.all_records().is_empty());
}

#[tokio::test]
async fn test_envelope_with_invalid_params_is_rejected() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);

    let result = dispatcher
        .enqueue_envelope(JobEnvelope {
            job_type: "ai_insight".to_string(),
            meta: JobMeta::new("tenant-1"),
            params: json!({"student_id": ""}),
            record_id: None,
        })
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Registry(RegistryError::InvalidParams { .. }))
    ));
    assert_eq!(harness.services.insight_calls(), 0);
}

#[tokio::test]
async fn test_without_broker_jobs_run_inline() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);

    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();

    assert!(!outcome.is_queued());
    assert!(outcome.run_outcome().is_some_and(JobRunOutcome::is_completed));
    assert_eq!(harness.services.insight_calls(), 1);
}

#[tokio::test]
async fn test_broker_hand_off_is_completed_by_worker() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    let worker = spawn_worker(&harness, &broker);
    let dispatcher = harness.dispatcher(Some(broker.clone()));
    let job = insight_job("tenant-1", "s-1");
    let job_key = job.job_key();

    let outcome = dispatcher.enqueue(Box::new(job)).await.unwrap();

    let DispatchOutcome::Queued {
        record_id,
        broker_job_id,
        ..
    } = &outcome
    else {
        panic!("expected hand-off, got {outcome:?}");
    };
    assert_eq!(broker_job_id, &job_key);

    wait_for_status(&dispatcher, "tenant-1", &job_key, JobStatus::Completed).await;
    let view = dispatcher.get_job_status("tenant-1", &job_key).await.unwrap();
    assert_eq!(view.record.id, *record_id);
    assert_eq!(view.record.broker_job_id.as_deref(), Some(job_key.as_str()));
    assert_eq!(harness.services.insight_calls(), 1);
    assert_eq!(harness.ledger.all_records().len(), 1);

    harness.runner.shutdown();
    worker.await.unwrap();
    let status = broker_status(&dispatcher, &job_key).await;
    assert!(status.is_some_and(|status| status.state == BrokerJobState::Finished));
}

async fn broker_status(dispatcher: &JobDispatcher, job_key: &str) -> Option<BrokerJobStatus> {
    dispatcher
        .get_job_status("tenant-1", job_key)
        .await
        .ok()
        .and_then(|view| view.broker_status)
}

#[tokio::test]
async fn test_completed_key_is_not_handed_off_again() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    let dispatcher = harness.dispatcher(Some(broker.clone()));

    assert!(harness
        .runner
        .run(&insight_job("tenant-1", "s-1"))
        .await
        .is_completed());

    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();

    assert!(outcome.run_outcome().is_some_and(JobRunOutcome::is_skipped));
    assert_eq!(broker.queued_count(), 0);
    assert_eq!(harness.services.insight_calls(), 1);
}

#[tokio::test]
async fn test_resubmitting_a_queued_job_reuses_its_record() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    let dispatcher = harness.dispatcher(Some(broker.clone()));

    let first = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();
    let second = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.queued_count(), 1);
    assert_eq!(harness.ledger.all_records().len(), 1);

    let worker = spawn_worker(&harness, &broker);
    wait_for_status(&dispatcher, "tenant-1", first.job_key(), JobStatus::Completed).await;

    let records = harness.ledger.all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Completed);
    assert_eq!(harness.services.insight_calls(), 1);

    harness.runner.shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_status_reports_completion_over_newer_records() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);
    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();
    let job = insight_job("tenant-1", "s-1");

    // A late duplicate is retired by the runner without executing
    let stray = harness
        .ledger
        .create(NewJobExecution {
            tenant_id: "tenant-1".to_string(),
            job_key: job.job_key(),
            job_type: JobType::AiInsight.identifier().to_string(),
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts: 3,
            actor_user_id: None,
            request_id: None,
            broker_job_id: None,
            created_at: chrono::Utc::now() + chrono::Duration::seconds(5),
        })
        .await
        .unwrap();
    assert!(harness
        .runner
        .run_with_record(&job, Some(stray.id))
        .await
        .is_skipped());

    let view = dispatcher
        .get_job_status("tenant-1", outcome.job_key())
        .await
        .unwrap();
    assert_eq!(view.record.status, JobStatus::Completed);
    assert_eq!(harness.services.insight_calls(), 1);
}

#[tokio::test]
async fn test_closed_broker_falls_back_inline() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    broker.close();
    let dispatcher = harness.dispatcher(Some(broker));

    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();

    assert!(outcome.run_outcome().is_some_and(JobRunOutcome::is_completed));
    assert_eq!(harness.ledger.all_records().len(), 1);
}

#[tokio::test]
async fn test_full_queue_falls_back_inline() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(1));
    let dispatcher = harness.dispatcher(Some(broker.clone()));

    let first = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();
    let second = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-2")))
        .await
        .unwrap();

    assert!(first.is_queued());
    assert!(second.run_outcome().is_some_and(JobRunOutcome::is_completed));
    assert_eq!(broker.queued_count(), 1);
    assert_eq!(harness.services.insight_calls(), 1);
}

#[tokio::test]
async fn test_open_job_queue_circuit_runs_pending_record_inline() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    let dispatcher = harness.dispatcher(Some(broker.clone()));
    harness.breakers.breaker(Feature::JobQueue).force_open().await;

    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();

    assert!(outcome.run_outcome().is_some_and(JobRunOutcome::is_completed));
    assert_eq!(broker.queued_count(), 0);
    // The pending record is reused rather than duplicated
    let records = harness.ledger.all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Completed);
    assert_eq!(
        harness.breakers.breaker(Feature::JobQueue).state().await,
        CircuitState::Open
    );
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let harness = Harness::new();
    let broker = Arc::new(InProcessBroker::new(8));
    let dispatcher = harness.dispatcher(Some(broker.clone()));
    let job = insight_job("tenant-1", "s-1");
    let job_key = job.job_key();

    assert!(dispatcher.enqueue(Box::new(job)).await.unwrap().is_queued());

    let cancelled = dispatcher.cancel_job("tenant-1", &job_key).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let view = dispatcher.get_job_status("tenant-1", &job_key).await.unwrap();
    assert_eq!(view.record.status, JobStatus::Cancelled);
    assert_eq!(
        view.broker_status.map(|status| status.state),
        Some(BrokerJobState::Cancelled)
    );

    let again = dispatcher.cancel_job("tenant-1", &job_key).await;
    assert!(matches!(
        again,
        Err(DispatchError::NotCancellable {
            status: JobStatus::Cancelled,
            ..
        })
    ));

    // A worker started afterwards skips the cancelled message
    let worker = spawn_worker(&harness, &broker);
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.runner.shutdown();
    worker.await.unwrap();
    assert_eq!(harness.services.insight_calls(), 0);
}

#[tokio::test]
async fn test_cancel_rejects_unknown_and_finished_jobs() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);

    let missing = dispatcher.cancel_job("tenant-1", "ai_insight:missing").await;
    assert!(matches!(missing, Err(DispatchError::NotFound { .. })));

    let outcome = dispatcher
        .enqueue(Box::new(insight_job("tenant-1", "s-1")))
        .await
        .unwrap();
    let finished = dispatcher.cancel_job("tenant-1", outcome.job_key()).await;
    assert!(matches!(
        finished,
        Err(DispatchError::NotCancellable {
            status: JobStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_list_jobs_filters_by_tenant_status_and_type() {
    let harness = Harness::builder()
        .services(StubDomainServices::new().script_insights(vec![Err(
            JobError::non_retryable("student not enrolled"),
        )]))
        .build();
    let dispatcher = harness.dispatcher(None);

    for student in ["s-1", "s-2", "s-3"] {
        dispatcher
            .enqueue(Box::new(insight_job("tenant-1", student)))
            .await
            .unwrap();
    }
    dispatcher
        .enqueue(Box::new(insight_job("tenant-2", "s-9")))
        .await
        .unwrap();

    let all = dispatcher
        .list_jobs("tenant-1", &JobFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|record| record.tenant_id == "tenant-1"));

    let failed = dispatcher
        .list_jobs(
            "tenant-1",
            &JobFilter {
                status: Some(JobStatus::Failed),
                ..JobFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_message.as_deref(), Some("student not enrolled"));

    let exports = dispatcher
        .list_jobs(
            "tenant-1",
            &JobFilter {
                job_type: Some("export_inspection".to_string()),
                ..JobFilter::default()
            },
        )
        .await
        .unwrap();
    assert!(exports.is_empty());
}

#[tokio::test]
async fn test_unknown_job_status_is_not_found() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(None);

    let result = dispatcher.get_job_status("tenant-1", "ai_insight:nope").await;
    assert!(matches!(result, Err(DispatchError::NotFound { .. })));
}

const BASE_CONFIG: &str = r#"
[circuit_breakers]
enabled = true

[circuit_breakers.features.AI_INSIGHTS]
failure_threshold = 2
window_seconds = 10

[jobs.types.ai_insight]
timeout_seconds = 5
max_retries = 1
retry_delay_seconds = 1

[dispatcher]
broker_enabled = true
queue_capacity = 4
worker_concurrency = 1
"#;

const TEST_OVERLAY: &str = r#"
[runner]
audit_timeout_ms = 100
"#;

#[tokio::test]
async fn test_core_bootstraps_from_config_directory() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("resilience.toml"), BASE_CONFIG)?;
    std::fs::write(dir.path().join("resilience.test.toml"), TEST_OVERLAY)?;

    let config = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")?;
    assert_eq!(config.config().runner.audit_timeout_ms, 100);
    assert_eq!(
        config.policies().feature_policy(Feature::AiInsights).failure_threshold,
        2
    );
    assert_eq!(config.policies().job_policy(JobType::AiInsight).max_retries, 1);

    let services = Arc::new(StubDomainServices::new());
    let core = ResilienceCore::from_config(config, services.clone()).await?;
    assert!(core.broker().is_some());

    let job = insight_job("tenant-1", "s-1");
    let job_key = job.job_key();
    let outcome = core.dispatcher().enqueue(Box::new(job)).await?;
    assert!(outcome.is_queued());
    wait_for_status(core.dispatcher(), "tenant-1", &job_key, JobStatus::Completed).await;
    assert_eq!(services.insight_calls(), 1);

    let health = core.circuit_health().await;
    assert_eq!(health.len(), Feature::ALL.len());
    assert!(health.iter().all(|h| h.state == CircuitState::Closed && h.healthy));
    let insights = health
        .iter()
        .find(|h| h.feature == Feature::AiInsights)
        .expect("AI_INSIGHTS health");
    assert_eq!(insights.metrics.success_count, 1);

    core.shutdown().await;
    assert!(core.runner().is_shutting_down());
    Ok(())
}
