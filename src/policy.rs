//! # Policy Registry
//!
//! Static lookup from [`Feature`] to [`ResiliencePolicy`] and from [`JobType`]
//! to [`JobPolicy`]. Built once at startup from compiled defaults plus the
//! overrides found in [`ResilienceConfig`], then shared read-only.

use crate::config::{
    ConfigResult, ConfigurationError, FeaturePolicyOverride, JobPolicyOverride, ResilienceConfig,
};
use crate::jobs::types::JobType;
use crate::resilience::backoff::BackoffStrategy;
use crate::resilience::Feature;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Circuit breaker behaviour for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,

    /// Length of the sliding failure window
    pub window_seconds: u64,

    /// Time spent open before probing
    pub open_duration_seconds: u64,

    /// Probe admissions, and successes needed to close, while half-open
    pub half_open_max_calls: u32,

    /// Human-readable message returned with the degraded payload
    pub fallback_message: String,

    /// Optional static data returned with the degraded payload
    pub fallback_data: Option<Value>,

    /// Whether an open circuit on this feature should page someone
    pub is_critical: bool,
}

impl ResiliencePolicy {
    pub fn new(
        failure_threshold: u32,
        window_seconds: u64,
        open_duration_seconds: u64,
        half_open_max_calls: u32,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            failure_threshold,
            window_seconds,
            open_duration_seconds,
            half_open_max_calls,
            fallback_message: fallback_message.into(),
            fallback_data: None,
            is_critical: false,
        }
    }

    pub fn with_fallback_data(mut self, data: Value) -> Self {
        self.fallback_data = Some(data);
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_seconds)
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.window_seconds == 0 {
            return Err("window_seconds must be greater than 0".to_string());
        }

        if self.open_duration_seconds == 0 {
            return Err("open_duration_seconds must be greater than 0".to_string());
        }

        if self.open_duration_seconds > 3600 {
            return Err("open_duration_seconds should not exceed 3600".to_string());
        }

        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be greater than 0".to_string());
        }

        if self.half_open_max_calls > 50 {
            return Err("half_open_max_calls should not exceed 50".to_string());
        }

        Ok(())
    }

    fn apply(&mut self, overrides: &FeaturePolicyOverride) {
        if let Some(value) = overrides.failure_threshold {
            self.failure_threshold = value;
        }
        if let Some(value) = overrides.window_seconds {
            self.window_seconds = value;
        }
        if let Some(value) = overrides.open_duration_seconds {
            self.open_duration_seconds = value;
        }
        if let Some(value) = overrides.half_open_max_calls {
            self.half_open_max_calls = value;
        }
        if let Some(value) = &overrides.fallback_message {
            self.fallback_message = value.clone();
        }
        if let Some(value) = &overrides.fallback_data {
            self.fallback_data = Some(value.clone());
        }
        if let Some(value) = overrides.is_critical {
            self.is_critical = value;
        }
    }

    /// Compiled default policy for a feature
    pub fn default_for(feature: Feature) -> Self {
        match feature {
            Feature::AiOcr => Self::new(
                5,
                60,
                60,
                2,
                "Document scanning is temporarily unavailable. Please enter the data manually or try again shortly.",
            ),
            Feature::AiInsights => Self::new(
                5,
                120,
                120,
                2,
                "AI insights are temporarily unavailable. Showing the most recent saved insights.",
            )
            .with_fallback_data(json!({ "insights": [] })),
            Feature::PaymentGateway => Self::new(
                3,
                60,
                30,
                1,
                "Online payments are temporarily unavailable. Please retry later or pay at the school office.",
            )
            .critical(),
            Feature::SmsGateway => Self::new(
                5,
                60,
                60,
                2,
                "SMS notifications are delayed. Messages will be sent once the provider recovers.",
            ),
            Feature::EmailDelivery => Self::new(
                5,
                120,
                60,
                2,
                "Email delivery is delayed. Messages will be sent once the provider recovers.",
            ),
            Feature::AnalyticsEngine => Self::new(
                3,
                60,
                90,
                2,
                "Live analytics are temporarily unavailable. Showing cached figures.",
            )
            .with_fallback_data(json!({ "cached": true })),
            Feature::DocumentExport => Self::new(
                3,
                60,
                60,
                1,
                "Exports are temporarily unavailable. Please try again in a few minutes.",
            ),
            Feature::JobQueue => Self::new(
                3,
                30,
                15,
                2,
                "Background processing is degraded. Work is running in the foreground.",
            )
            .critical(),
        }
    }
}

/// Execution limits for one job type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Bound on a single `execute` attempt
    pub timeout_seconds: u64,

    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay between attempts when no explicit backoff is configured
    pub retry_delay_seconds: u64,

    /// Always true: every job is keyed for at-most-once completion
    pub idempotent: bool,

    /// Audit action type emitted for the job's lifecycle events
    pub audit_action: String,

    /// Optional non-fixed backoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
}

impl JobPolicy {
    pub fn new(
        timeout_seconds: u64,
        max_retries: u32,
        retry_delay_seconds: u64,
        audit_action: impl Into<String>,
    ) -> Self {
        Self {
            timeout_seconds,
            max_retries,
            retry_delay_seconds,
            idempotent: true,
            audit_action: audit_action.into(),
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Effective backoff strategy
    pub fn backoff_strategy(&self) -> BackoffStrategy {
        self.backoff
            .clone()
            .unwrap_or_else(|| BackoffStrategy::fixed(self.retry_delay_seconds))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be greater than 0".to_string());
        }

        if self.timeout_seconds > 86_400 {
            return Err("timeout_seconds should not exceed 86400".to_string());
        }

        if self.max_retries > 20 {
            return Err("max_retries should not exceed 20".to_string());
        }

        if !self.idempotent {
            return Err("jobs must be idempotent".to_string());
        }

        if self.audit_action.trim().is_empty() {
            return Err("audit_action must not be empty".to_string());
        }

        self.backoff_strategy().validate()?;

        Ok(())
    }

    fn apply(&mut self, overrides: &JobPolicyOverride) {
        if let Some(value) = overrides.timeout_seconds {
            self.timeout_seconds = value;
        }
        if let Some(value) = overrides.max_retries {
            self.max_retries = value;
        }
        if let Some(value) = overrides.retry_delay_seconds {
            self.retry_delay_seconds = value;
        }
        if let Some(value) = &overrides.audit_action {
            self.audit_action = value.clone();
        }
        if let Some(value) = &overrides.backoff {
            self.backoff = Some(value.clone());
        }
    }

    /// Compiled default policy for a job type
    pub fn default_for(job_type: JobType) -> Self {
        match job_type {
            JobType::AiInsight => Self::new(120, 2, 10, "AI_INSIGHT_GENERATED"),
            JobType::AnalyticsSnapshot => Self::new(300, 3, 30, "ANALYTICS_SNAPSHOT_CREATED")
                .with_backoff(BackoffStrategy::Exponential {
                    base_seconds: 30,
                    multiplier: 2.0,
                    max_seconds: 600,
                }),
            JobType::ExportInspection => Self::new(180, 2, 15, "INSPECTION_EXPORTED"),
        }
    }
}

/// Read-only policy lookup shared across the resilience layer
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    features: HashMap<Feature, ResiliencePolicy>,
    jobs: HashMap<JobType, JobPolicy>,
}

impl PolicyRegistry {
    /// Registry populated with compiled defaults only
    pub fn defaults() -> Self {
        Self {
            features: Feature::ALL
                .iter()
                .map(|feature| (*feature, ResiliencePolicy::default_for(*feature)))
                .collect(),
            jobs: JobType::ALL
                .iter()
                .map(|job_type| (*job_type, JobPolicy::default_for(*job_type)))
                .collect(),
        }
    }

    /// Registry with configuration overrides applied and validated
    pub fn from_config(config: &ResilienceConfig) -> ConfigResult<Self> {
        let mut registry = Self::defaults();

        for (name, overrides) in &config.circuit_breakers.features {
            let feature: Feature = name.parse().map_err(|reason: String| {
                ConfigurationError::invalid_value(
                    format!("circuit_breakers.features.{name}"),
                    name.clone(),
                    reason,
                )
            })?;
            if let Some(policy) = registry.features.get_mut(&feature) {
                policy.apply(overrides);
            }
        }

        for (name, overrides) in &config.jobs.types {
            let job_type = JobType::from_identifier(name).ok_or_else(|| {
                ConfigurationError::invalid_value(
                    format!("jobs.types.{name}"),
                    name.clone(),
                    "Unknown job type",
                )
            })?;
            if let Some(policy) = registry.jobs.get_mut(&job_type) {
                policy.apply(overrides);
            }
        }

        registry.validate()?;
        Ok(registry)
    }

    /// Replace one feature policy (tests and embedding hosts)
    pub fn with_feature_policy(mut self, feature: Feature, policy: ResiliencePolicy) -> Self {
        self.features.insert(feature, policy);
        self
    }

    /// Replace one job policy (tests and embedding hosts)
    pub fn with_job_policy(mut self, job_type: JobType, policy: JobPolicy) -> Self {
        self.jobs.insert(job_type, policy);
        self
    }

    pub fn feature_policy(&self, feature: Feature) -> ResiliencePolicy {
        self.features
            .get(&feature)
            .cloned()
            .unwrap_or_else(|| ResiliencePolicy::default_for(feature))
    }

    pub fn job_policy(&self, job_type: JobType) -> JobPolicy {
        self.jobs
            .get(&job_type)
            .cloned()
            .unwrap_or_else(|| JobPolicy::default_for(job_type))
    }

    /// Features whose open circuit is considered critical
    pub fn critical_features(&self) -> Vec<Feature> {
        let mut critical: Vec<Feature> = self
            .features
            .iter()
            .filter(|(_, policy)| policy.is_critical)
            .map(|(feature, _)| *feature)
            .collect();
        critical.sort();
        critical
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (feature, policy) in &self.features {
            policy.validate().map_err(|reason| {
                ConfigurationError::validation_error(format!("feature {feature}: {reason}"))
            })?;
        }
        for (job_type, policy) in &self.jobs {
            policy.validate().map_err(|reason| {
                ConfigurationError::validation_error(format!("job type {job_type}: {reason}"))
            })?;
        }
        Ok(())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::defaults()
    }
}
