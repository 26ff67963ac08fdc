//! # Circuit Breaker
//!
//! Façade binding one [`Feature`] to its policy, the shared
//! [`CircuitStateStore`] and the metrics sink.
//!
//! Two calling contracts are offered and intentionally differ:
//!
//! - [`CircuitBreaker::execute`] returns the operation's error to the caller
//!   after recording it; only an open circuit produces a fallback.
//! - [`CircuitBreaker::execute_or_fallback`] swallows the error and returns
//!   the fallback payload with the error message merged in.
//!
//! A half-open probe whose future is dropped before it finishes (a caller
//! timeout, a cancelled task) counts as a failed probe and reopens the
//! circuit.

use crate::policy::{PolicyRegistry, ResiliencePolicy};
use crate::resilience::metrics::{MetricsSink, RequestOutcome};
use crate::resilience::state_store::{CircuitState, CircuitStateStore, FeatureState};
use crate::resilience::Feature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Status string carried by every fallback payload
pub const DEGRADED_STATUS: &str = "degraded";

/// Payload returned instead of performing the real operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackResponse {
    /// Always `"degraded"`
    pub status: String,
    pub message: String,
    pub feature: Feature,
    pub circuit_state: CircuitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_data: Option<Value>,
    /// Set by [`CircuitBreaker::execute_or_fallback`] when the operation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FallbackResponse {
    pub fn new(feature: Feature, policy: &ResiliencePolicy, circuit_state: CircuitState) -> Self {
        Self {
            status: DEGRADED_STATUS.to_string(),
            message: policy.fallback_message.clone(),
            feature,
            circuit_state,
            fallback_data: policy.fallback_data.clone(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Result of a protected call that did not raise
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    /// The operation ran and returned a value
    Completed(T),
    /// The operation was skipped (or failed under the decorator contract)
    Fallback(FallbackResponse),
}

impl<T> CallOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Fallback(_) => None,
        }
    }

    pub fn fallback(&self) -> Option<&FallbackResponse> {
        match self {
            Self::Completed(_) => None,
            Self::Fallback(fallback) => Some(fallback),
        }
    }
}

impl<T: Serialize> CallOutcome<T> {
    /// JSON body for HTTP callers: the value itself, or the degraded payload
    pub fn into_json(self) -> Value {
        match self {
            Self::Completed(value) => serde_json::to_value(value).unwrap_or(Value::Null),
            Self::Fallback(fallback) => serde_json::to_value(fallback).unwrap_or(Value::Null),
        }
    }
}

/// Errors returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not attempted
    #[error("Circuit breaker is open for {}", .0.feature)]
    CircuitOpen(FallbackResponse),

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

/// Short type name used as the failure's error kind
fn error_kind_of<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Error kind recorded for a half-open probe dropped before it finished
pub const ABANDONED_PROBE: &str = "AbandonedProbe";

/// Armed while an admitted half-open probe is in flight
struct ProbeGuard {
    pending: Option<(Arc<dyn CircuitStateStore>, Feature)>,
}

impl ProbeGuard {
    fn new(breaker: &CircuitBreaker, probing: bool) -> Self {
        Self {
            pending: probing.then(|| (breaker.store.clone(), breaker.feature)),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let Some((store, feature)) = self.pending.take() else {
            return;
        };
        warn!(feature = %feature, "Half-open probe dropped before completion");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    store.record_failure(feature, ABANDONED_PROBE).await;
                });
            }
            // The store releases the slot once the probe round goes stale
            Err(_) => debug!(feature = %feature, "No runtime to record the abandoned probe"),
        }
    }
}

/// Per-feature circuit breaker handle; cheap to clone
#[derive(Clone)]
pub struct CircuitBreaker {
    feature: Feature,
    policy: ResiliencePolicy,
    store: Arc<dyn CircuitStateStore>,
    metrics: Arc<dyn MetricsSink>,
    enabled: bool,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("feature", &self.feature)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        feature: Feature,
        policies: &PolicyRegistry,
        store: Arc<dyn CircuitStateStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            feature,
            policy: policies.feature_policy(feature),
            store,
            metrics,
            enabled: true,
        }
    }

    /// A disabled breaker always admits calls and records nothing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub async fn state(&self) -> CircuitState {
        self.store.get_state(self.feature).await
    }

    pub async fn snapshot(&self) -> FeatureState {
        self.store.snapshot(self.feature).await
    }

    /// Admission check; consumes a probe slot while half-open
    pub async fn can_call(&self) -> bool {
        if !self.enabled {
            return true;
        }
        self.store.can_execute(self.feature).await
    }

    pub async fn record_success(&self) {
        if self.enabled {
            self.store.record_success(self.feature).await;
        }
    }

    /// Record a failure classified by its error type
    pub async fn record_failure<E: ?Sized>(&self, _error: &E) -> CircuitState {
        self.record_failure_kind(error_kind_of::<E>()).await
    }

    /// Record a failure with an explicit error kind
    pub async fn record_failure_kind(&self, error_kind: &str) -> CircuitState {
        if !self.enabled {
            return CircuitState::Closed;
        }
        self.store.record_failure(self.feature, error_kind).await
    }

    /// Degraded payload for the current state
    pub async fn fallback(&self) -> FallbackResponse {
        let state = self.state().await;
        FallbackResponse::new(self.feature, &self.policy, state)
    }

    /// Run `operation` unless the circuit rejects it; errors are returned
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<CallOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let probing = self.enabled && self.state().await == CircuitState::HalfOpen;
        if !self.can_call().await {
            self.metrics.record_request(
                self.feature,
                RequestOutcome::Rejected,
                std::time::Duration::ZERO,
            );
            let fallback = self.fallback().await;
            debug!(
                feature = %self.feature,
                circuit_state = %fallback.circuit_state,
                "Call rejected, returning fallback"
            );
            return Ok(CallOutcome::Fallback(fallback));
        }

        let mut probe = ProbeGuard::new(self, probing);
        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();
        probe.disarm();

        match result {
            Ok(value) => {
                self.metrics
                    .record_request(self.feature, RequestOutcome::Success, duration);
                self.record_success().await;
                Ok(CallOutcome::Completed(value))
            }
            Err(error) => {
                self.metrics
                    .record_request(self.feature, RequestOutcome::Failure, duration);
                let state = self.record_failure(&error).await;
                warn!(
                    feature = %self.feature,
                    circuit_state = %state,
                    duration_ms = duration.as_millis() as u64,
                    error = %error,
                    "Protected operation failed"
                );
                Err(error)
            }
        }
    }

    /// Decorator contract: failures become a fallback carrying the error message
    pub async fn execute_or_fallback<F, Fut, T, E>(&self, operation: F) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.execute(operation).await {
            Ok(outcome) => outcome,
            Err(error) => {
                CallOutcome::Fallback(self.fallback().await.with_error(error.to_string()))
            }
        }
    }

    /// Internal-caller contract: an open circuit is an error variant
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.execute(operation).await {
            Ok(CallOutcome::Completed(value)) => Ok(value),
            Ok(CallOutcome::Fallback(fallback)) => Err(CircuitBreakerError::CircuitOpen(fallback)),
            Err(error) => Err(CircuitBreakerError::OperationFailed(error)),
        }
    }

    pub async fn force_open(&self) {
        warn!(feature = %self.feature, "🚨 Circuit breaker forced open");
        self.store.force_open(self.feature).await;
    }

    pub async fn force_close(&self) {
        warn!(feature = %self.feature, "🚨 Circuit breaker forced closed");
        self.store.force_close(self.feature).await;
    }

    pub async fn reset(&self) {
        self.store.reset(self.feature).await;
    }
}

/// Hands out breakers that share one store and metrics sink
#[derive(Clone)]
pub struct CircuitBreakers {
    policies: Arc<PolicyRegistry>,
    store: Arc<dyn CircuitStateStore>,
    metrics: Arc<dyn MetricsSink>,
    enabled: bool,
}

impl fmt::Debug for CircuitBreakers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakers")
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CircuitBreakers {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        store: Arc<dyn CircuitStateStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            policies,
            store,
            metrics,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn breaker(&self, feature: Feature) -> CircuitBreaker {
        CircuitBreaker::new(
            feature,
            &self.policies,
            self.store.clone(),
            self.metrics.clone(),
        )
        .with_enabled(self.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn CircuitStateStore> {
        &self.store
    }
}
