//! # Retry Backoff Strategies
//!
//! Delay calculation between job attempts. The runner only depends on the
//! [`Backoff`] trait; [`BackoffStrategy`] is the serializable form carried by
//! [`JobPolicy`](crate::policy::JobPolicy) and configuration files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Computes the wait before the next attempt
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// Delay to wait after `attempt` (1-based) failed
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Upper bound for any configured delay
pub const MAX_DELAY_SECONDS: u64 = 86_400;

/// Built-in backoff strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every attempt
    Fixed { delay_seconds: u64 },

    /// `base + increment * (attempt - 1)`, capped at `max_seconds`
    Linear {
        base_seconds: u64,
        increment_seconds: u64,
        max_seconds: u64,
    },

    /// `base * multiplier^(attempt - 1)`, capped at `max_seconds`
    Exponential {
        base_seconds: u64,
        multiplier: f64,
        max_seconds: u64,
    },
}

impl BackoffStrategy {
    pub fn fixed(delay_seconds: u64) -> Self {
        Self::Fixed { delay_seconds }
    }

    pub fn validate(&self) -> Result<(), String> {
        let longest = match self {
            Self::Fixed { delay_seconds } => *delay_seconds,
            Self::Linear { max_seconds, .. } | Self::Exponential { max_seconds, .. } => {
                *max_seconds
            }
        };
        if longest > MAX_DELAY_SECONDS {
            return Err(format!(
                "backoff delays must not exceed {MAX_DELAY_SECONDS} seconds"
            ));
        }

        match self {
            Self::Fixed { .. } => Ok(()),
            Self::Linear {
                base_seconds,
                max_seconds,
                ..
            } => {
                if max_seconds < base_seconds {
                    return Err("linear backoff max_seconds must be >= base_seconds".to_string());
                }
                Ok(())
            }
            Self::Exponential {
                base_seconds,
                multiplier,
                max_seconds,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err("exponential backoff multiplier must be >= 1.0".to_string());
                }
                if max_seconds < base_seconds {
                    return Err(
                        "exponential backoff max_seconds must be >= base_seconds".to_string()
                    );
                }
                Ok(())
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::fixed(1)
    }
}

impl Backoff for BackoffStrategy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay_seconds } => Duration::from_secs(*delay_seconds),
            Self::Linear {
                base_seconds,
                increment_seconds,
                max_seconds,
            } => {
                let delay = base_seconds
                    .saturating_add(increment_seconds.saturating_mul(u64::from(step)));
                Duration::from_secs(delay.min(*max_seconds))
            }
            Self::Exponential {
                base_seconds,
                multiplier,
                max_seconds,
            } => {
                let factor = multiplier.powi(step.min(i32::MAX as u32) as i32);
                let delay = (*base_seconds as f64 * factor).min(*max_seconds as f64);
                Duration::try_from_secs_f64(delay.max(0.0))
                    .unwrap_or_else(|_| Duration::from_secs(*max_seconds))
            }
        }
    }
}
