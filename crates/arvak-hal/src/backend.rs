//! Backend trait.
//!
//! Experiment tracking only needs a narrow slice of a backend: its identity
//! and the ability to re-attach to a job by id after a reload.
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `name()` | sync | yes | `&str` |
//! | `provider()` | sync | provided | `Option<&str>` |
//! | `retrieve_job()` | async | yes | `HalResult<Arc<dyn Job>>` |

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HalResult;
use crate::job::{Job, JobId};

/// Trait for quantum backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Name of the provider hosting this backend, if any.
    ///
    /// Providers are used to look up the experiment service that belongs to
    /// a backend.
    fn provider(&self) -> Option<&str> {
        None
    }

    /// Retrieve a previously submitted job by its identifier.
    async fn retrieve_job(&self, job_id: &JobId) -> HalResult<Arc<dyn Job>>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("provider", &self.provider())
            .finish()
    }
}

/// Check whether two backend handles refer to the same backend.
///
/// Backends are compared by identity first and by name as a fallback, so two
/// handles created independently for the same device compare equal.
pub fn same_backend(a: &Arc<dyn Backend>, b: &Arc<dyn Backend>) -> bool {
    Arc::ptr_eq(a, b) || a.name() == b.name()
}
