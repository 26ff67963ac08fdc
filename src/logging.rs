//! # Structured Logging Module
//!
//! Environment-aware structured logging for the resilience layer. Console
//! output by default, JSON lines when `CAMPUS_LOG_FORMAT=json`. `RUST_LOG`
//! overrides the environment's default level.

use crate::resilience::{CircuitState, Feature};
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("CAMPUS_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host process may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("CAMPUS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a circuit state transition
pub fn log_circuit_transition(
    feature: Feature,
    from: CircuitState,
    to: CircuitState,
    reason: &str,
    is_critical: bool,
) {
    match to {
        CircuitState::Open => tracing::error!(
            feature = %feature,
            from = %from,
            to = %to,
            reason = reason,
            critical = is_critical,
            "🔴 Circuit breaker opened (failing fast)"
        ),
        CircuitState::HalfOpen => tracing::info!(
            feature = %feature,
            from = %from,
            to = %to,
            reason = reason,
            "🟡 Circuit breaker half-open (testing recovery)"
        ),
        CircuitState::Closed => tracing::info!(
            feature = %feature,
            from = %from,
            to = %to,
            reason = reason,
            "🟢 Circuit breaker closed (recovered)"
        ),
    }
}

/// Log structured data for job lifecycle operations
pub fn log_job_operation(
    operation: &str,
    tenant_id: &str,
    job_key: &str,
    job_type: &str,
    attempt: Option<u32>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        tenant_id = %tenant_id,
        job_key = %job_key,
        job_type = %job_type,
        attempt = attempt,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
