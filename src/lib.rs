#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Campus Core
//!
//! Fault-tolerance execution layer for the campus platform.
//!
//! ## Overview
//!
//! Two cooperating halves keep the platform usable while its dependencies
//! misbehave:
//!
//! - **Circuit breakers** per protected capability ([`resilience::Feature`]),
//!   with a sliding failure window, fail-fast while open, bounded half-open
//!   probing and a degraded fallback payload.
//! - **Background jobs** executed idempotently: keyed by a deterministic
//!   job key, recorded in an execution ledger, retried on transient errors,
//!   bounded by per-type timeouts, audited, and handed to a broker when one
//!   is available.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit state store, breakers, metrics and backoff
//! - [`policy`] - Per-feature and per-job-type policies
//! - [`jobs`] - Job types, registry, runner and dispatcher
//! - [`ledger`] - Idempotency ledger (in-memory and PostgreSQL)
//! - [`broker`] - Broker contract and the in-process broker
//! - [`audit`] - Audit sink contract
//! - [`config`] - Layered configuration
//! - [`core`] - Bootstrap of every component
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use campus_core::config::ConfigManager;
//! use campus_core::core::ResilienceCore;
//! use campus_core::jobs::DomainServices;
//! use campus_core::resilience::Feature;
//! use std::sync::Arc;
//!
//! # async fn example(services: Arc<dyn DomainServices>) -> Result<(), Box<dyn std::error::Error>> {
//! campus_core::logging::init_structured_logging();
//! let core = ResilienceCore::from_config(ConfigManager::load()?, services).await?;
//!
//! let outcome = core
//!     .breaker(Feature::PaymentGateway)
//!     .execute_or_fallback(|| async { Ok::<_, std::io::Error>("charged") })
//!     .await;
//! println!("degraded: {}", outcome.is_fallback());
//!
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib                                  # Unit tests
//! cargo test                                        # Unit and integration tests
//! DATABASE_URL=postgres://... cargo test --features postgres-tests
//! ```

pub mod audit;
pub mod broker;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod policy;
pub mod resilience;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigManager, ResilienceConfig};
pub use core::{CircuitHealth, ResilienceCore};
pub use error::{CampusError, Result};
pub use jobs::{
    DispatchOutcome, DomainServices, Job, JobDispatcher, JobError, JobMeta, JobRunOutcome,
    JobRunner, JobType,
};
pub use ledger::{ExecutionLedger, InMemoryLedger, JobExecutionRecord, JobStatus};
pub use policy::{JobPolicy, PolicyRegistry, ResiliencePolicy};
pub use resilience::{
    CallOutcome, CircuitBreaker, CircuitBreakerError, CircuitState, FallbackResponse, Feature,
};
