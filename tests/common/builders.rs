//! Test harness wiring the runner and dispatcher over in-memory backends.

use super::mocks::{RecordingAuditSink, StubDomainServices};
use campus_core::audit::AuditSink;
use campus_core::broker::{InProcessBroker, JobBroker};
use campus_core::clock::ManualClock;
use campus_core::config::{RunnerSettings, UnclassifiedErrorPolicy};
use campus_core::jobs::{
    AiInsightJob, AiInsightParams, JobDispatcher, JobMeta, JobRegistry, JobRunner, JobType,
};
use campus_core::ledger::InMemoryLedger;
use campus_core::policy::{JobPolicy, PolicyRegistry, ResiliencePolicy};
use campus_core::resilience::{CircuitBreakers, CircuitMetricsCollector, Feature, InMemoryCircuitStore};
use std::sync::Arc;

/// Everything a runner or dispatcher test needs, sharing one clock
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub policies: Arc<PolicyRegistry>,
    pub metrics: Arc<CircuitMetricsCollector>,
    pub breakers: CircuitBreakers,
    pub ledger: Arc<InMemoryLedger>,
    pub audit: Arc<RecordingAuditSink>,
    pub services: Arc<StubDomainServices>,
    pub runner: Arc<JobRunner>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Harness with default policies and services
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Dispatcher over the builtin registry, optionally with a broker
    pub fn dispatcher(&self, broker: Option<Arc<InProcessBroker>>) -> JobDispatcher {
        let dispatcher = JobDispatcher::new(
            Arc::new(JobRegistry::builtin()),
            self.runner.clone(),
            self.breakers.clone(),
        )
        .with_clock(self.clock.clone());
        match broker {
            Some(broker) => dispatcher.with_broker(broker as Arc<dyn JobBroker>),
            None => dispatcher,
        }
    }
}

pub struct HarnessBuilder {
    policies: PolicyRegistry,
    settings: RunnerSettings,
    audit: Option<Arc<dyn AuditSink>>,
    services: StubDomainServices,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            policies: PolicyRegistry::defaults(),
            settings: RunnerSettings::default(),
            audit: None,
            services: StubDomainServices::new(),
        }
    }
}

impl HarnessBuilder {
    pub fn job_policy(mut self, job_type: JobType, policy: JobPolicy) -> Self {
        self.policies = self.policies.with_job_policy(job_type, policy);
        self
    }

    pub fn feature_policy(mut self, feature: Feature, policy: ResiliencePolicy) -> Self {
        self.policies = self.policies.with_feature_policy(feature, policy);
        self
    }

    pub fn unclassified_errors(mut self, policy: UnclassifiedErrorPolicy) -> Self {
        self.settings.unclassified_errors = policy;
        self
    }

    pub fn audit_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.settings.audit_timeout_ms = timeout_ms;
        self
    }

    /// Replace the recording audit sink the runner writes to
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn services(mut self, services: StubDomainServices) -> Self {
        self.services = services;
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::at_epoch());
        let policies = Arc::new(self.policies);
        let metrics = Arc::new(CircuitMetricsCollector::new());
        let store = Arc::new(InMemoryCircuitStore::new(
            policies.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let breakers = CircuitBreakers::new(policies.clone(), store, metrics.clone());

        let ledger = Arc::new(InMemoryLedger::new());
        let recording = Arc::new(RecordingAuditSink::default());
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => recording.clone(),
        };
        let services = Arc::new(self.services);

        let runner = Arc::new(
            JobRunner::new(ledger.clone(), audit, services.clone(), breakers.clone())
                .with_clock(clock.clone())
                .with_settings(self.settings),
        );

        Harness {
            clock,
            policies,
            metrics,
            breakers,
            ledger,
            audit: recording,
            services,
            runner,
        }
    }
}

/// Fast-failing policy: 5s timeout, 2 retries, 1s delay
pub fn quick_job_policy() -> JobPolicy {
    JobPolicy::new(5, 2, 1, "AI_INSIGHT_GENERATED")
}

pub fn insight_job(tenant_id: &str, student_id: &str) -> AiInsightJob {
    AiInsightJob::new(
        JobMeta::new(tenant_id).with_actor("user-7"),
        AiInsightParams {
            student_id: student_id.to_string(),
            term: "2026-T1".to_string(),
        },
    )
    .expect("valid insight params")
}
