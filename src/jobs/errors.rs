//! Job execution errors and the retry decision.

use crate::config::UnclassifiedErrorPolicy;
use crate::resilience::CircuitBreakerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification a job attaches to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient; another attempt may succeed
    Retryable,
    /// Permanent for these inputs
    NonRetryable,
    /// The job itself is broken (panics, invariant violations)
    Fatal,
    /// No classification; the runner applies [`UnclassifiedErrorPolicy`]
    Unclassified,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::Fatal => "fatal",
            Self::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

/// Error returned by [`Job::execute`](super::Job::execute)
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attempt exceeded its time budget
    pub fn timed_out(timeout: Duration) -> Self {
        Self::retryable(format!(
            "Job execution timed out after {}s",
            timeout.as_secs_f64()
        ))
        .with_code("TIMEOUT")
    }

    /// Attempt panicked
    pub fn panicked(detail: &str) -> Self {
        Self::fatal(format!("Job panicked: {detail}")).with_code("PANIC")
    }

    /// Unwrap a breaker-protected call whose operation already speaks `JobError`
    pub fn from_breaker(error: CircuitBreakerError<JobError>) -> Self {
        match error {
            CircuitBreakerError::OperationFailed(inner) => inner,
            open @ CircuitBreakerError::CircuitOpen(_) => open.into(),
        }
    }

    /// Parameters could not be decoded or failed validation
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_code("INVALID_PARAMS")
    }
}

impl<E: fmt::Display> From<CircuitBreakerError<E>> for JobError {
    fn from(error: CircuitBreakerError<E>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen(fallback) => Self::retryable(format!(
                "Circuit open for {}: {}",
                fallback.feature, fallback.message
            ))
            .with_code("CIRCUIT_OPEN"),
            CircuitBreakerError::OperationFailed(inner) => Self::unclassified(inner.to_string()),
        }
    }
}

/// What the runner does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

impl RetryDecision {
    /// `attempt` is 1-based and counts the attempt that just failed
    pub fn decide(
        kind: ErrorKind,
        attempt: u32,
        max_attempts: u32,
        unclassified: UnclassifiedErrorPolicy,
    ) -> Self {
        let retryable = match kind {
            ErrorKind::Retryable => true,
            ErrorKind::NonRetryable | ErrorKind::Fatal => false,
            ErrorKind::Unclassified => unclassified == UnclassifiedErrorPolicy::Retry,
        };

        if retryable && attempt < max_attempts {
            Self::Retry
        } else {
            Self::GiveUp
        }
    }
}
