//! # Resilience Module
//!
//! Per-feature circuit breakers with sliding failure windows and automatic
//! half-open recovery, plus the backoff strategies used by the job runner.
//!
//! ## Architecture
//!
//! - **State Store**: concurrency-safe per-feature failure history and state
//! - **Circuit Breakers**: façade that consults the store around a protected call
//! - **Metrics**: best-effort sinks for request outcomes and circuit openings
//! - **Backoff**: pluggable delay strategies between job attempts
//!
//! ## Usage
//!
//! ```rust,no_run
//! use campus_core::clock::system_clock;
//! use campus_core::policy::PolicyRegistry;
//! use campus_core::resilience::{
//!     CircuitBreaker, CircuitMetricsCollector, Feature, InMemoryCircuitStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policies = Arc::new(PolicyRegistry::defaults());
//! let metrics = Arc::new(CircuitMetricsCollector::new());
//! let store = Arc::new(InMemoryCircuitStore::new(policies.clone(), system_clock(), metrics.clone()));
//!
//! let breaker = CircuitBreaker::new(Feature::AiOcr, &policies, store, metrics);
//! let outcome = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("scanned") })
//!     .await?;
//! println!("fallback used: {}", outcome.is_fallback());
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod feature;
pub mod metrics;
pub mod state_store;

pub use backoff::{Backoff, BackoffStrategy};
pub use circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitBreakerError, CircuitBreakers, FallbackResponse,
    ABANDONED_PROBE, DEGRADED_STATUS,
};
pub use feature::Feature;
pub use metrics::{
    CircuitMetricsCollector, CompositeMetrics, FeatureMetrics, MetricsSink, NoopMetrics,
    OtelMetricsSink, RequestOutcome,
};
pub use state_store::{
    CircuitState, CircuitStateStore, FailureRecord, FeatureState, InMemoryCircuitStore,
};
