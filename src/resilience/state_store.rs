//! # Circuit State Store
//!
//! Per-feature failure history and circuit state. The [`CircuitStateStore`]
//! trait is the seam for shared backends; [`InMemoryCircuitStore`] keeps
//! everything in process memory behind a single mutex.
//!
//! ## State Transitions
//!
//! ```text
//! Closed   → Open:     failures inside the sliding window >= failure_threshold
//! Open     → HalfOpen: open_duration elapsed (resolved lazily on read)
//! HalfOpen → Closed:   half_open_max_calls successes
//! HalfOpen → Open:     any failure
//! HalfOpen → HalfOpen: every probe slot taken and no verdict within
//!                      open_duration; the probe round restarts
//! ```
//!
//! Every read-modify-write sequence (prune + threshold check, half-open
//! admission) runs under the store lock. The lock is never held across an
//! `.await`.

use crate::clock::SharedClock;
use crate::logging::log_circuit_transition;
use crate::policy::{PolicyRegistry, ResiliencePolicy};
use crate::resilience::metrics::MetricsSink;
use crate::resilience::Feature;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    #[default]
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a bounded number of probe calls is admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// One failure inside the sliding window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub error_kind: String,
}

/// Mutable per-feature circuit state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureState {
    pub state: CircuitState,
    pub failures: VecDeque<FailureRecord>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_at: Option<DateTime<Utc>>,
    pub half_open_calls: u32,
    pub half_open_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// A state change, reported after the store lock is released
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: &'static str,
}

fn seconds(value: u64) -> ChronoDuration {
    i64::try_from(value)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .unwrap_or(ChronoDuration::MAX)
}

impl FeatureState {
    /// Drop failures at or before `now - window`
    fn prune(&mut self, now: DateTime<Utc>, policy: &ResiliencePolicy) {
        if let Some(cutoff) = now.checked_sub_signed(seconds(policy.window_seconds)) {
            self.failures.retain(|failure| failure.at > cutoff);
        }
    }

    /// Lazily move Open → HalfOpen once the open duration has elapsed, and
    /// release probe slots whose calls never reported back
    fn resolve(&mut self, now: DateTime<Utc>, policy: &ResiliencePolicy) -> Option<Transition> {
        let open_duration = seconds(policy.open_duration_seconds);
        match self.state {
            CircuitState::Open => {
                let opened_at = self.opened_at?;
                if now - opened_at < open_duration {
                    return None;
                }
                Some(self.begin_probing(now, "open duration elapsed"))
            }
            CircuitState::HalfOpen => {
                let probing_since = self.half_open_at?;
                if self.half_open_calls < policy.half_open_max_calls
                    || now - probing_since < open_duration
                {
                    return None;
                }
                Some(self.begin_probing(now, "unanswered probes expired"))
            }
            CircuitState::Closed => None,
        }
    }

    fn begin_probing(&mut self, now: DateTime<Utc>, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = CircuitState::HalfOpen;
        self.half_open_at = Some(now);
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        Transition {
            from,
            to: CircuitState::HalfOpen,
            reason,
        }
    }

    fn open(&mut self, now: DateTime<Utc>, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_at = None;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        Transition {
            from,
            to: CircuitState::Open,
            reason,
        }
    }

    fn close(&mut self, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.half_open_at = None;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        Transition {
            from,
            to: CircuitState::Closed,
            reason,
        }
    }

    /// Failures currently inside the window
    pub fn failures_in_window(&self) -> usize {
        self.failures.len()
    }
}

/// Storage and state machine behind every circuit breaker
#[async_trait]
pub trait CircuitStateStore: Send + Sync + fmt::Debug {
    /// Current state, resolving Open → HalfOpen once the open duration elapsed
    async fn get_state(&self, feature: Feature) -> CircuitState;

    /// Admission check; counts half-open probes against the probe cap
    async fn can_execute(&self, feature: Feature) -> bool;

    async fn record_success(&self, feature: Feature);

    /// Record a failure and return the resulting state
    async fn record_failure(&self, feature: Feature, error_kind: &str) -> CircuitState;

    async fn force_open(&self, feature: Feature);

    async fn force_close(&self, feature: Feature);

    /// Forget everything about the feature
    async fn reset(&self, feature: Feature);

    /// Pruned copy of the feature's state
    async fn snapshot(&self, feature: Feature) -> FeatureState;

    /// Pruned copies of every feature referenced so far
    async fn snapshot_all(&self) -> Vec<(Feature, FeatureState)>;
}

/// Process-local circuit state
///
/// Horizontally scaled deployments each hold independent circuit state with
/// this backend.
#[derive(Debug)]
pub struct InMemoryCircuitStore {
    policies: Arc<PolicyRegistry>,
    clock: SharedClock,
    metrics: Arc<dyn MetricsSink>,
    states: Mutex<HashMap<Feature, FeatureState>>,
}

impl InMemoryCircuitStore {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        clock: SharedClock,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            policies,
            clock,
            metrics,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the feature's state under the store lock, then report
    /// any transitions it produced
    fn with_state<R>(
        &self,
        feature: Feature,
        f: impl FnOnce(&mut FeatureState, &ResiliencePolicy, DateTime<Utc>, &mut Vec<Transition>) -> R,
    ) -> R {
        let policy = self.policies.feature_policy(feature);
        let now = self.clock.now();
        let mut transitions = Vec::new();

        let result = {
            let mut states = self.states.lock();
            let state = states.entry(feature).or_default();
            if let Some(transition) = state.resolve(now, &policy) {
                transitions.push(transition);
            }
            state.prune(now, &policy);
            f(state, &policy, now, &mut transitions)
        };

        for transition in transitions {
            if transition.to == CircuitState::Open {
                self.metrics.record_circuit_open(feature);
            }
            log_circuit_transition(
                feature,
                transition.from,
                transition.to,
                transition.reason,
                policy.is_critical,
            );
        }

        result
    }
}

#[async_trait]
impl CircuitStateStore for InMemoryCircuitStore {
    async fn get_state(&self, feature: Feature) -> CircuitState {
        self.with_state(feature, |state, _, _, _| state.state)
    }

    async fn can_execute(&self, feature: Feature) -> bool {
        self.with_state(feature, |state, policy, _, _| match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.half_open_calls >= policy.half_open_max_calls {
                    false
                } else {
                    state.half_open_calls += 1;
                    true
                }
            }
        })
    }

    async fn record_success(&self, feature: Feature) {
        self.with_state(feature, |state, policy, _, transitions| {
            state.total_successes += 1;
            match state.state {
                CircuitState::HalfOpen => {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= policy.half_open_max_calls {
                        transitions.push(state.close("half-open probes succeeded"));
                    }
                }
                CircuitState::Open => {
                    debug!(feature = %feature, "Success recorded while circuit is open");
                }
                CircuitState::Closed => {}
            }
        });
    }

    async fn record_failure(&self, feature: Feature, error_kind: &str) -> CircuitState {
        self.with_state(feature, |state, policy, now, transitions| {
            state.failures.push_back(FailureRecord {
                at: now,
                error_kind: error_kind.to_string(),
            });
            state.total_failures += 1;

            match state.state {
                CircuitState::HalfOpen => {
                    transitions.push(state.open(now, "failure while half-open"));
                }
                CircuitState::Closed => {
                    state.prune(now, policy);
                    if state.failures.len() >= policy.failure_threshold as usize {
                        transitions.push(state.open(now, "failure threshold reached"));
                    }
                }
                CircuitState::Open => {}
            }
            state.state
        })
    }

    async fn force_open(&self, feature: Feature) {
        self.with_state(feature, |state, _, now, transitions| {
            transitions.push(state.open(now, "forced open"));
        });
    }

    async fn force_close(&self, feature: Feature) {
        self.with_state(feature, |state, _, _, transitions| {
            transitions.push(state.close("forced closed"));
        });
    }

    async fn reset(&self, feature: Feature) {
        let mut states = self.states.lock();
        states.insert(feature, FeatureState::default());
        debug!(feature = %feature, "Circuit state reset");
    }

    async fn snapshot(&self, feature: Feature) -> FeatureState {
        self.with_state(feature, |state, _, _, _| state.clone())
    }

    async fn snapshot_all(&self) -> Vec<(Feature, FeatureState)> {
        let mut features: Vec<Feature> = self.states.lock().keys().copied().collect();
        features.sort();

        let mut snapshots = Vec::with_capacity(features.len());
        for feature in features {
            snapshots.push((feature, self.snapshot(feature).await));
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::resilience::metrics::CircuitMetricsCollector;
    use std::time::Duration;

    fn store_with(policy: ResiliencePolicy) -> (InMemoryCircuitStore, ManualClock, Arc<CircuitMetricsCollector>) {
        let clock = ManualClock::at_epoch();
        let metrics = Arc::new(CircuitMetricsCollector::new());
        let policies = PolicyRegistry::defaults().with_feature_policy(Feature::AiOcr, policy);
        let store = InMemoryCircuitStore::new(
            Arc::new(policies),
            Arc::new(clock.clone()),
            metrics.clone(),
        );
        (store, clock, metrics)
    }

    fn policy(threshold: u32, window: u64, open: u64, half_open: u32) -> ResiliencePolicy {
        ResiliencePolicy::new(threshold, window, open, half_open, "OCR unavailable")
    }

    #[tokio::test]
    async fn test_threshold_opens_circuit() {
        let (store, clock, metrics) = store_with(policy(3, 60, 90, 2));

        for _ in 0..2 {
            assert_eq!(store.record_failure(Feature::AiOcr, "Timeout").await, CircuitState::Closed);
            clock.advance(Duration::from_secs(10));
        }
        assert!(store.can_execute(Feature::AiOcr).await);

        assert_eq!(store.record_failure(Feature::AiOcr, "Timeout").await, CircuitState::Open);
        assert!(!store.can_execute(Feature::AiOcr).await);
        assert_eq!(metrics.snapshot(Feature::AiOcr).circuit_opened_count, 1);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let (store, clock, _) = store_with(policy(3, 60, 90, 2));

        store.record_failure(Feature::AiOcr, "Timeout").await;
        store.record_failure(Feature::AiOcr, "Timeout").await;
        clock.advance(Duration::from_secs(60));

        // The first two are exactly `window` old and are pruned
        assert_eq!(store.record_failure(Feature::AiOcr, "Timeout").await, CircuitState::Closed);
        assert_eq!(store.snapshot(Feature::AiOcr).await.failures_in_window(), 1);
    }

    #[tokio::test]
    async fn test_no_premature_half_open() {
        let (store, clock, _) = store_with(policy(1, 60, 90, 2));

        store.record_failure(Feature::AiOcr, "Network").await;
        clock.advance(Duration::from_secs(89));
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_admission_cap() {
        let (store, clock, _) = store_with(policy(1, 60, 10, 2));

        store.record_failure(Feature::AiOcr, "Network").await;
        clock.advance(Duration::from_secs(10));

        assert!(store.can_execute(Feature::AiOcr).await);
        assert!(store.can_execute(Feature::AiOcr).await);
        assert!(!store.can_execute(Feature::AiOcr).await);
        assert_eq!(store.snapshot(Feature::AiOcr).await.half_open_calls, 2);
    }

    #[tokio::test]
    async fn test_unanswered_half_open_calls_are_released() {
        let (store, clock, metrics) = store_with(policy(1, 60, 10, 1));

        store.record_failure(Feature::AiOcr, "Network").await;
        clock.advance(Duration::from_secs(10));
        assert!(store.can_execute(Feature::AiOcr).await);

        // The probe never reports back
        clock.advance(Duration::from_secs(9));
        assert!(!store.can_execute(Feature::AiOcr).await);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::HalfOpen);
        assert!(store.can_execute(Feature::AiOcr).await);
        store.record_success(Feature::AiOcr).await;
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::Closed);
        assert_eq!(metrics.snapshot(Feature::AiOcr).circuit_opened_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let (store, clock, metrics) = store_with(policy(1, 60, 10, 3));

        store.record_failure(Feature::AiOcr, "Network").await;
        clock.advance(Duration::from_secs(10));
        assert!(store.can_execute(Feature::AiOcr).await);
        store.record_success(Feature::AiOcr).await;

        assert_eq!(store.record_failure(Feature::AiOcr, "Network").await, CircuitState::Open);
        let snapshot = store.snapshot(Feature::AiOcr).await;
        assert_eq!(snapshot.half_open_calls, 0);
        assert_eq!(snapshot.half_open_successes, 0);
        assert_eq!(snapshot.opened_at, Some(clock.now()));
        assert_eq!(metrics.snapshot(Feature::AiOcr).circuit_opened_count, 2);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let (store, clock, _) = store_with(policy(1, 600, 10, 2));

        store.record_failure(Feature::AiOcr, "Network").await;
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::HalfOpen);

        store.record_success(Feature::AiOcr).await;
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::HalfOpen);

        store.record_success(Feature::AiOcr).await;
        let snapshot = store.snapshot(Feature::AiOcr).await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(snapshot.failures.is_empty());
        assert_eq!(snapshot.total_successes, 2);
        assert_eq!(snapshot.total_failures, 1);
    }

    #[tokio::test]
    async fn test_force_and_reset() {
        let (store, _, _) = store_with(policy(5, 60, 30, 1));

        store.record_failure(Feature::AiOcr, "Network").await;
        store.force_open(Feature::AiOcr).await;
        assert!(!store.can_execute(Feature::AiOcr).await);

        store.force_close(Feature::AiOcr).await;
        let snapshot = store.snapshot(Feature::AiOcr).await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(snapshot.failures.is_empty());
        assert_eq!(snapshot.total_failures, 1);

        store.reset(Feature::AiOcr).await;
        assert_eq!(store.snapshot(Feature::AiOcr).await, FeatureState::default());
    }

    #[tokio::test]
    async fn test_features_are_isolated() {
        let (store, _, _) = store_with(policy(1, 60, 30, 1));

        store.record_failure(Feature::AiOcr, "Network").await;
        assert_eq!(store.get_state(Feature::AiOcr).await, CircuitState::Open);
        assert_eq!(store.get_state(Feature::SmsGateway).await, CircuitState::Closed);

        let all = store.snapshot_all().await;
        assert_eq!(all.len(), 2);
    }
}
