//! # Background Jobs
//!
//! Idempotent background job execution.
//!
//! ## Architecture
//!
//! - **Types**: closed [`JobType`] set, request metadata and job-key derivation
//! - **Job**: the capability each concrete job implements
//! - **Registry**: allowlist of constructible job types
//! - **Runner**: ledger-backed, retrying, timeout-bounded execution
//! - **Dispatcher**: broker hand-off with in-process fallback
//!
//! ## Usage
//!
//! ```rust,no_run
//! use campus_core::jobs::{AiInsightJob, AiInsightParams, JobMeta};
//! # use campus_core::jobs::JobDispatcher;
//!
//! # async fn example(dispatcher: &JobDispatcher) -> Result<(), Box<dyn std::error::Error>> {
//! let job = AiInsightJob::new(
//!     JobMeta::new("tenant-1").with_actor("user-7"),
//!     AiInsightParams { student_id: "s-42".into(), term: "2026-T1".into() },
//! )?;
//! let outcome = dispatcher.enqueue(Box::new(job)).await?;
//! println!("job {} queued: {}", outcome.job_key(), outcome.is_queued());
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod dispatcher;
pub mod errors;
pub mod job;
mod key_lock;
pub mod registry;
pub mod runner;
pub mod types;

pub use builtin::{
    AiInsightJob, AiInsightParams, AnalyticsSnapshotJob, AnalyticsSnapshotParams, ExportFormat,
    ExportInspectionJob, ExportInspectionParams,
};
pub use dispatcher::{DispatchError, DispatchOutcome, DispatchResult, JobDispatcher, JobStatusView};
pub use errors::{ErrorKind, JobError, RetryDecision};
pub use job::{DomainServices, Job, JobContext};
pub use registry::{JobConstructor, JobRegistry, RegistryError, RegistryStats};
pub use runner::{JobRunOutcome, JobRunner};
pub use types::{derive_job_key, JobEnvelope, JobMeta, JobType};
