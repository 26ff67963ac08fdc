//! # Resilience Core
//!
//! Single bootstrap path for the resilience layer. Every component is an
//! explicitly constructed instance owned here and shared by `Arc`:
//!
//! ```text
//! ConfigManager ─▶ PolicyRegistry ─▶ InMemoryCircuitStore ─▶ CircuitBreakers
//!                                                         │
//!   ExecutionLedger + AuditSink + DomainServices ─▶ JobRunner ─▶ JobDispatcher
//!                                                         │           │
//!                                               BrokerWorker ◀── InProcessBroker
//! ```

use crate::audit::{AuditSink, TracingAuditSink};
use crate::broker::{BrokerWorker, InProcessBroker, JobBroker};
use crate::clock::{system_clock, SharedClock};
use crate::config::ConfigManager;
use crate::error::Result;
use crate::jobs::{DomainServices, JobDispatcher, JobRegistry, JobRunner};
use crate::ledger::{ExecutionLedger, InMemoryLedger};
use crate::policy::PolicyRegistry;
use crate::resilience::{
    CircuitBreaker, CircuitBreakers, CircuitMetricsCollector, CircuitState, CircuitStateStore,
    CompositeMetrics, Feature, FeatureMetrics, InMemoryCircuitStore, MetricsSink, OtelMetricsSink,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health of one feature's circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitHealth {
    pub feature: Feature,
    pub state: CircuitState,
    pub is_critical: bool,
    pub failures_in_window: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub metrics: FeatureMetrics,
    pub healthy: bool,
}

/// Builder for [`ResilienceCore`]; anything not supplied gets the default
pub struct ResilienceCoreBuilder {
    config: Arc<ConfigManager>,
    services: Arc<dyn DomainServices>,
    clock: SharedClock,
    audit: Arc<dyn AuditSink>,
    ledger: Option<Arc<dyn ExecutionLedger>>,
    registry: JobRegistry,
    extra_metrics: Vec<Arc<dyn MetricsSink>>,
}

impl ResilienceCoreBuilder {
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Use this ledger instead of the one derived from `database` settings
    pub fn with_ledger(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.extra_metrics.push(sink);
        self
    }

    pub async fn build(self) -> Result<ResilienceCore> {
        let settings = self.config.config().clone();
        let policies = Arc::new(self.config.policies().clone());

        let metrics = Arc::new(CircuitMetricsCollector::new());
        let mut sinks: Vec<Arc<dyn MetricsSink>> =
            vec![metrics.clone(), Arc::new(OtelMetricsSink::new())];
        sinks.extend(self.extra_metrics);
        let sink: Arc<dyn MetricsSink> = Arc::new(CompositeMetrics::new(sinks));

        let store: Arc<dyn CircuitStateStore> = Arc::new(InMemoryCircuitStore::new(
            policies.clone(),
            self.clock.clone(),
            sink.clone(),
        ));
        let breakers = CircuitBreakers::new(policies.clone(), store.clone(), sink)
            .with_enabled(settings.circuit_breakers.enabled);
        if breakers.is_enabled() {
            info!("🛡️ CORE: Circuit breakers enabled");
        } else {
            warn!("📤 CORE: Circuit breakers disabled in configuration");
        }

        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => default_ledger(&settings.database).await?,
        };

        let runner = Arc::new(
            JobRunner::new(ledger.clone(), self.audit, self.services, breakers.clone())
                .with_clock(self.clock.clone())
                .with_settings(settings.runner.clone()),
        );
        let registry = Arc::new(self.registry);

        let mut dispatcher = JobDispatcher::new(registry.clone(), runner.clone(), breakers.clone())
            .with_clock(self.clock.clone())
            .with_list_limit(settings.dispatcher.list_limit);

        let (broker, worker) = if settings.dispatcher.broker_enabled {
            let broker = Arc::new(
                InProcessBroker::new(settings.dispatcher.queue_capacity)
                    .with_clock(self.clock.clone()),
            );
            let worker = BrokerWorker::new(
                broker.clone(),
                registry.clone(),
                runner.clone(),
                settings.dispatcher.worker_concurrency,
            )
            .spawn()?;
            dispatcher = dispatcher.with_broker(broker.clone() as Arc<dyn JobBroker>);
            info!(
                queue_capacity = settings.dispatcher.queue_capacity,
                worker_concurrency = settings.dispatcher.worker_concurrency,
                "📬 CORE: In-process broker started"
            );
            (Some(broker), Some(worker))
        } else {
            info!("📬 CORE: Broker disabled, jobs run in the submitting task");
            (None, None)
        };

        info!(
            environment = self.config.environment(),
            "✅ CORE: Resilience core initialized"
        );

        Ok(ResilienceCore {
            config: self.config,
            policies,
            store,
            metrics,
            breakers,
            ledger,
            registry,
            runner,
            dispatcher: Arc::new(dispatcher),
            broker,
            worker: Mutex::new(worker),
        })
    }
}

#[cfg(feature = "postgres")]
async fn default_ledger(
    database: &crate::config::DatabaseSettings,
) -> Result<Arc<dyn ExecutionLedger>> {
    if database.url.is_some() {
        let ledger = crate::ledger::PgExecutionLedger::connect(database).await?;
        return Ok(Arc::new(ledger));
    }
    info!("🗄️ CORE: No database configured, using in-memory execution ledger");
    Ok(Arc::new(InMemoryLedger::new()))
}

#[cfg(not(feature = "postgres"))]
async fn default_ledger(
    database: &crate::config::DatabaseSettings,
) -> Result<Arc<dyn ExecutionLedger>> {
    if database.url.is_some() {
        warn!("🗄️ CORE: database.url set but the postgres feature is disabled, using in-memory ledger");
    }
    Ok(Arc::new(InMemoryLedger::new()))
}

/// Owns every resilience component for the lifetime of the host process
pub struct ResilienceCore {
    config: Arc<ConfigManager>,
    policies: Arc<PolicyRegistry>,
    store: Arc<dyn CircuitStateStore>,
    metrics: Arc<CircuitMetricsCollector>,
    breakers: CircuitBreakers,
    ledger: Arc<dyn ExecutionLedger>,
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    dispatcher: Arc<JobDispatcher>,
    broker: Option<Arc<InProcessBroker>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResilienceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceCore")
            .field("environment", &self.config.environment())
            .field("breakers", &self.breakers)
            .field("broker", &self.broker)
            .finish()
    }
}

impl ResilienceCore {
    pub fn builder(
        config: Arc<ConfigManager>,
        services: Arc<dyn DomainServices>,
    ) -> ResilienceCoreBuilder {
        ResilienceCoreBuilder {
            config,
            services,
            clock: system_clock(),
            audit: Arc::new(TracingAuditSink),
            ledger: None,
            registry: JobRegistry::builtin(),
            extra_metrics: Vec::new(),
        }
    }

    /// Bootstrap with defaults for everything the configuration does not name
    pub async fn from_config(
        config: Arc<ConfigManager>,
        services: Arc<dyn DomainServices>,
    ) -> Result<Self> {
        Self::builder(config, services).build().await
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn breaker(&self, feature: Feature) -> CircuitBreaker {
        self.breakers.breaker(feature)
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<CircuitMetricsCollector> {
        &self.metrics
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn broker(&self) -> Option<&Arc<InProcessBroker>> {
        self.broker.as_ref()
    }

    /// State and metrics of every feature's circuit
    pub async fn circuit_health(&self) -> Vec<CircuitHealth> {
        let mut health = Vec::with_capacity(Feature::ALL.len());
        for feature in Feature::ALL {
            let state = self.store.get_state(feature).await;
            let snapshot = self.store.snapshot(feature).await;
            let metrics = self.metrics.snapshot(feature);
            health.push(CircuitHealth {
                feature,
                state,
                is_critical: self.policies.feature_policy(feature).is_critical,
                failures_in_window: snapshot.failures_in_window(),
                total_failures: snapshot.total_failures,
                total_successes: snapshot.total_successes,
                healthy: metrics.is_healthy(state),
                metrics,
            });
        }
        health
    }

    /// Stop accepting broker work, cancel backoff waits and wait for the
    /// worker to drain in-flight jobs
    pub async fn shutdown(&self) {
        info!("🛑 CORE: Shutting down resilience core");
        self.runner.shutdown();
        if let Some(broker) = &self.broker {
            broker.close();
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Broker worker ended abnormally");
            }
        }
        info!("✅ CORE: Shutdown complete");
    }
}
