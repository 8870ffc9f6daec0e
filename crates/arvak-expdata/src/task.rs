//! Background task handles and the worker pools that run them.
//!
//! Every background unit of work (job result extraction, add-jobs timeouts,
//! analysis wait-sets, analysis callbacks) is spawned onto the runtime owned
//! by an [`Executors`] value and tracked through a cloneable [`TaskHandle`].
//! Any number of waiters can await the same handle and inspect its outcome
//! without consuming it.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::runtime::Handle;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::error::{ExpDataError, ExpDataResult};

/// Default size of the analysis pool.
///
/// One callback can be running while a second one is staged, so a late
/// cancellation can still pre-empt the staged callback.
pub const DEFAULT_ANALYSIS_WORKERS: usize = 2;

/// How a background task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task applied its work.
    Done,
    /// The task finished without applying its work: the job was cancelled
    /// or errored, or the callback was cancelled or raised.
    NotApplied,
    /// The task failed unexpectedly, panicked, or was aborted.
    Failed(Arc<str>),
}

impl TaskOutcome {
    /// Whether the task failed unexpectedly.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }
}

/// A cloneable handle to a spawned background task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Shared<BoxFuture<'static, TaskOutcome>>,
    abort: AbortHandle,
}

impl TaskHandle {
    /// Spawn `future` on `runtime` and track it.
    pub fn spawn<F>(runtime: &Handle, future: F) -> Self
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let join = runtime.spawn(future);
        let abort = join.abort_handle();
        let shared = async move {
            match join.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => TaskOutcome::Failed("task was aborted".into()),
                Err(e) => TaskOutcome::Failed(panic_message(e.into_panic()).into()),
            }
        }
        .boxed()
        .shared();
        Self { shared, abort }
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Outcome of the task if it has finished.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        if let Some(outcome) = self.shared.peek() {
            return Some(outcome.clone());
        }
        if !self.is_finished() {
            return None;
        }
        self.shared.clone().now_or_never()
    }

    /// Wait for the task to finish.
    pub async fn wait(&self) -> TaskOutcome {
        self.shared.clone().await
    }

    /// Abort the task.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Result of waiting on a set of tasks.
#[derive(Debug, Clone, Default)]
pub struct WaitSummary {
    /// Number of tasks still running when the wait ended.
    pub pending: usize,
    /// Messages of tasks that failed unexpectedly.
    pub failures: Vec<Arc<str>>,
}

impl WaitSummary {
    /// Whether the wait ran out of time.
    pub fn timed_out(&self) -> bool {
        self.pending > 0
    }

    /// Whether every task finished without an unexpected failure.
    pub fn all_ok(&self) -> bool {
        self.pending == 0 && self.failures.is_empty()
    }
}

/// Wait for `handles` to finish, up to `timeout`.
///
/// `name` and `experiment_id` only label the log records.
pub async fn wait_for_tasks(
    handles: &[TaskHandle],
    timeout: Option<Duration>,
    name: &str,
    experiment_id: &str,
) -> WaitSummary {
    let all = join_all(handles.iter().map(TaskHandle::wait));
    match timeout {
        Some(limit) => {
            let _ = tokio::time::timeout(limit, all).await;
        }
        None => {
            all.await;
        }
    }

    let mut summary = WaitSummary::default();
    for handle in handles {
        match handle.outcome() {
            None => summary.pending += 1,
            Some(TaskOutcome::Failed(msg)) => summary.failures.push(msg),
            Some(_) => {}
        }
    }

    if summary.timed_out() {
        info!(
            experiment_id,
            pending = summary.pending,
            "Waiting for {name} timed out before completion"
        );
    }
    if !summary.failures.is_empty() {
        error!(
            experiment_id,
            failures = %summary.failures.join("\n"),
            "{name} raised exceptions"
        );
    }
    summary
}

/// The worker pools owned by one experiment container.
///
/// Job extraction and monitor tasks run unbounded on the runtime; analysis
/// callbacks additionally take a slot from a fair semaphore.
#[derive(Clone)]
pub struct Executors {
    runtime: Handle,
    analysis_slots: Arc<Semaphore>,
}

impl Executors {
    /// Create pools on `runtime` with `analysis_workers` analysis slots.
    pub fn new(runtime: Handle, analysis_workers: usize) -> Self {
        debug!(analysis_workers, "Creating experiment executors");
        Self {
            runtime,
            analysis_slots: Arc::new(Semaphore::new(analysis_workers.max(1))),
        }
    }

    /// Create pools on the ambient tokio runtime.
    pub fn current() -> ExpDataResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ExpDataError::InvalidArgument(format!("no tokio runtime available: {e}"))
        })?;
        Ok(Self::new(runtime, DEFAULT_ANALYSIS_WORKERS))
    }

    /// The runtime tasks are spawned onto.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Spawn a job extraction or timeout task.
    pub fn spawn_job_task<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        TaskHandle::spawn(&self.runtime, future)
    }

    /// Spawn a monitor task (analysis wait-sets).
    pub fn spawn_monitor<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        TaskHandle::spawn(&self.runtime, future)
    }

    /// Spawn an analysis callback execution task.
    pub fn spawn_analysis<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        TaskHandle::spawn(&self.runtime, future)
    }

    /// Wait for a free analysis slot.
    pub async fn analysis_slot(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.analysis_slots.clone().acquire_owned().await
    }

    /// Number of analysis slots currently free.
    pub fn free_analysis_slots(&self) -> usize {
        self.analysis_slots.available_permits()
    }
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executors")
            .field("free_analysis_slots", &self.free_analysis_slots())
            .finish_non_exhaustive()
    }
}
