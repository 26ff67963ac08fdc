//! # Circuit Breaker Metrics
//!
//! Best-effort metrics sinks for circuit breaker activity. Every sink method is
//! synchronous and non-blocking; a sink must never fail the protected call.
//!
//! - [`CircuitMetricsCollector`]: in-process per-feature counters, used for
//!   health snapshots
//! - [`OtelMetricsSink`]: forwards to the global OpenTelemetry meter
//! - [`CompositeMetrics`]: fan-out to several sinks

use crate::resilience::{CircuitState, Feature};
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of one protected request, as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    Failure,
    /// Short-circuited by an open circuit; the operation never ran
    Rejected,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        }
    }
}

/// Destination for circuit breaker metrics
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record_circuit_open(&self, feature: Feature);

    fn record_request(&self, feature: Feature, outcome: RequestOutcome, duration: Duration);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_circuit_open(&self, _feature: Feature) {}

    fn record_request(&self, _feature: Feature, _outcome: RequestOutcome, _duration: Duration) {}
}

#[derive(Debug, Default)]
struct FeatureCounters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
    circuit_opened_count: AtomicU64,
    total_duration_micros: AtomicU64,
}

/// Point-in-time metrics for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetrics {
    /// Calls that reached the breaker, rejected ones included
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls short-circuited while open or over the half-open cap
    pub rejected_count: u64,

    /// Times the circuit transitioned to open
    pub circuit_opened_count: u64,

    /// failures / (successes + failures), 0.0 when nothing executed
    pub failure_rate: f64,

    /// Average duration of executed calls
    pub average_duration: Duration,
}

impl FeatureMetrics {
    fn empty() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            circuit_opened_count: 0,
            failure_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Check if metrics indicate healthy operation in the given state
    pub fn is_healthy(&self, state: CircuitState) -> bool {
        match state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "Calls: {} | Failures: {} ({:.1}%) | Rejected: {} | Opened: {} | Avg Duration: {}ms",
            self.total_calls,
            self.failure_count,
            self.failure_rate * 100.0,
            self.rejected_count,
            self.circuit_opened_count,
            self.average_duration.as_millis()
        )
    }
}

/// In-process per-feature counters
#[derive(Debug, Default)]
pub struct CircuitMetricsCollector {
    features: DashMap<Feature, FeatureCounters>,
}

impl CircuitMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for one feature; zeros if it has never been touched
    pub fn snapshot(&self, feature: Feature) -> FeatureMetrics {
        let Some(counters) = self.features.get(&feature) else {
            return FeatureMetrics::empty();
        };

        let success_count = counters.success_count.load(Ordering::Relaxed);
        let failure_count = counters.failure_count.load(Ordering::Relaxed);
        let executed = success_count + failure_count;
        let total_micros = counters.total_duration_micros.load(Ordering::Relaxed);

        FeatureMetrics {
            total_calls: counters.total_calls.load(Ordering::Relaxed),
            success_count,
            failure_count,
            rejected_count: counters.rejected_count.load(Ordering::Relaxed),
            circuit_opened_count: counters.circuit_opened_count.load(Ordering::Relaxed),
            failure_rate: if executed == 0 {
                0.0
            } else {
                failure_count as f64 / executed as f64
            },
            average_duration: if executed == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_micros / executed)
            },
        }
    }

    /// Snapshots for every feature seen so far
    pub fn snapshot_all(&self) -> Vec<(Feature, FeatureMetrics)> {
        let mut features: Vec<Feature> = self.features.iter().map(|entry| *entry.key()).collect();
        features.sort();
        features
            .into_iter()
            .map(|feature| (feature, self.snapshot(feature)))
            .collect()
    }
}

impl MetricsSink for CircuitMetricsCollector {
    fn record_circuit_open(&self, feature: Feature) {
        self.features
            .entry(feature)
            .or_default()
            .circuit_opened_count
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_request(&self, feature: Feature, outcome: RequestOutcome, duration: Duration) {
        let counters = self.features.entry(feature).or_default();
        counters.total_calls.fetch_add(1, Ordering::Relaxed);
        match outcome {
            RequestOutcome::Success => {
                counters.success_count.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Failure => {
                counters.failure_count.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Rejected => {
                counters.rejected_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        counters
            .total_duration_micros
            .fetch_add(micros, Ordering::Relaxed);
    }
}

/// Forwards metrics to the globally installed OpenTelemetry meter provider
///
/// Exporter setup belongs to the host process; without one the instruments
/// are no-ops.
#[derive(Debug)]
pub struct OtelMetricsSink {
    circuit_opened: Counter<u64>,
    requests: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl OtelMetricsSink {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("campus_core");
        Self {
            circuit_opened: meter
                .u64_counter("campus.circuit.opened")
                .with_description("Circuit transitions to open")
                .build(),
            requests: meter
                .u64_counter("campus.circuit.requests")
                .with_description("Protected requests by outcome")
                .build(),
            request_duration: meter
                .f64_histogram("campus.circuit.request_duration")
                .with_description("Protected request duration")
                .with_unit("s")
                .build(),
        }
    }
}

impl Default for OtelMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for OtelMetricsSink {
    fn record_circuit_open(&self, feature: Feature) {
        self.circuit_opened
            .add(1, &[KeyValue::new("feature", feature.as_str())]);
    }

    fn record_request(&self, feature: Feature, outcome: RequestOutcome, duration: Duration) {
        let attributes = [
            KeyValue::new("feature", feature.as_str()),
            KeyValue::new("outcome", outcome.as_str()),
        ];
        self.requests.add(1, &attributes);
        if outcome != RequestOutcome::Rejected {
            self.request_duration
                .record(duration.as_secs_f64(), &attributes);
        }
    }
}

/// Fan-out to several sinks
#[derive(Debug, Default, Clone)]
pub struct CompositeMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetrics {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for CompositeMetrics {
    fn record_circuit_open(&self, feature: Feature) {
        for sink in &self.sinks {
            sink.record_circuit_open(feature);
        }
    }

    fn record_request(&self, feature: Feature, outcome: RequestOutcome, duration: Duration) {
        for sink in &self.sinks {
            sink.record_request(feature, outcome, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_counts_by_outcome() {
        let collector = CircuitMetricsCollector::new();
        collector.record_request(
            Feature::AiOcr,
            RequestOutcome::Success,
            Duration::from_millis(10),
        );
        collector.record_request(
            Feature::AiOcr,
            RequestOutcome::Failure,
            Duration::from_millis(30),
        );
        collector.record_request(Feature::AiOcr, RequestOutcome::Rejected, Duration::ZERO);
        collector.record_circuit_open(Feature::AiOcr);

        let metrics = collector.snapshot(Feature::AiOcr);
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.rejected_count, 1);
        assert_eq!(metrics.circuit_opened_count, 1);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.average_duration, Duration::from_millis(20));
        assert!(!metrics.is_healthy(CircuitState::Closed));
    }

    #[test]
    fn test_untouched_feature_is_empty() {
        let collector = CircuitMetricsCollector::new();
        let metrics = collector.snapshot(Feature::SmsGateway);
        assert_eq!(metrics.total_calls, 0);
        assert!(metrics.is_healthy(CircuitState::Closed));
        assert!(collector.snapshot_all().is_empty());
    }

    #[test]
    fn test_composite_fans_out() {
        let first = Arc::new(CircuitMetricsCollector::new());
        let second = Arc::new(CircuitMetricsCollector::new());
        let composite = CompositeMetrics::new(vec![first.clone(), second.clone()]);

        composite.record_circuit_open(Feature::PaymentGateway);

        assert_eq!(first.snapshot(Feature::PaymentGateway).circuit_opened_count, 1);
        assert_eq!(second.snapshot(Feature::PaymentGateway).circuit_opened_count, 1);
    }
}
