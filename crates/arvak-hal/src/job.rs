//! Job handles and lifecycle states.
//!
//! The job state machine:
//!
//! ```text
//!   Initializing ──→ Validating ──→ Queued ──→ Running ──→ Done
//!        │               │            │          │
//!        │               │            │          ├──→ Error
//!        │               │            │          │
//!        └───────────────┴────────────┴──────────┴──→ Cancelled
//! ```
//!
//! **Invariants:**
//! - Transitions are monotonic: a job never moves backward.
//! - Final states (`Done`, `Error`, `Cancelled`) are permanent.
//! - [`Job::result`] resolves only once the job has reached a final state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::HalResult;
use crate::result::JobResult;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new job ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a job as reported by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is being created.
    Initializing,
    /// Job is waiting in queue.
    Queued,
    /// Job is being validated by the backend.
    Validating,
    /// Job is currently running.
    Running,
    /// Job was cancelled.
    Cancelled,
    /// Job completed successfully.
    Done,
    /// Job failed.
    Error,
}

impl JobStatus {
    /// Check if this is a final state.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Validating => "VALIDATING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A handle to a job running on some backend.
///
/// Handles are shared between the foreground API and background extraction
/// tasks, so every method takes `&self`.
#[async_trait]
pub trait Job: Send + Sync {
    /// Identifier of this job.
    fn job_id(&self) -> &JobId;

    /// Backend the job was submitted to.
    fn backend(&self) -> Arc<dyn Backend>;

    /// Current status of the job.
    async fn status(&self) -> HalResult<JobStatus>;

    /// Wait for the job to finish and return its result.
    ///
    /// Fails if the job was cancelled or errored.
    async fn result(&self) -> HalResult<JobResult>;

    /// Request cancellation of the job.
    async fn cancel(&self) -> HalResult<()>;

    /// Error reported by the backend, if the job failed.
    async fn error_message(&self) -> Option<String> {
        None
    }
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", self.job_id())
            .finish_non_exhaustive()
    }
}
