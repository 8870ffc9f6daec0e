//! Analysis callback scheduling and cancellation.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ExperimentData;
use crate::callback::{
    AnalysisCallback, AnalysisFn, CallbackKwargs, in_analysis_callback, scope_callback,
};
use crate::status::AnalysisStatus;
use crate::task::{TaskHandle, TaskOutcome, panic_message, wait_for_tasks};

impl ExperimentData {
    /// Queue an analysis callback.
    ///
    /// The callback runs once every job and callback registered before it
    /// has finished, and is skipped if any of them failed unexpectedly or
    /// if it is cancelled first. Returns the callback id.
    pub fn add_analysis_callback(
        self: &Arc<Self>,
        callback: Arc<dyn AnalysisFn>,
        kwargs: CallbackKwargs,
    ) -> String {
        let callback_id = Uuid::new_v4().simple().to_string();

        let job_futures = self.job_futures.lock();
        let mut analysis_futures = self.analysis_futures.lock();

        let record = AnalysisCallback::new(callback.name(), callback_id.clone());
        let token = record.cancel.clone();
        self.callbacks.insert(callback_id.clone(), record);

        let wait_set: Vec<TaskHandle> = job_futures
            .values()
            .chain(analysis_futures.values())
            .cloned()
            .collect();
        let experiment_id = self.id.clone();
        let wait_task = self.executors.spawn_monitor(async move {
            let summary =
                wait_for_tasks(&wait_set, None, "jobs and analysis", &experiment_id).await;
            if summary.failures.is_empty() {
                TaskOutcome::Done
            } else {
                TaskOutcome::NotApplied
            }
        });

        let handle = self.executors.spawn_analysis(Self::run_analysis_callback(
            Arc::downgrade(self),
            callback_id.clone(),
            wait_task,
            token,
            callback,
            kwargs,
        ));
        analysis_futures.insert(callback_id.clone(), handle);
        debug!(experiment_id = %self.id, callback_id = %callback_id, "Queued analysis callback");
        callback_id
    }

    async fn run_analysis_callback(
        weak: Weak<Self>,
        callback_id: String,
        wait_task: TaskHandle,
        token: CancellationToken,
        callback: Arc<dyn AnalysisFn>,
        kwargs: CallbackKwargs,
    ) -> TaskOutcome {
        let ready = tokio::select! {
            biased;
            () = token.cancelled() => false,
            outcome = wait_task.wait() => outcome == TaskOutcome::Done,
        };
        if !ready {
            wait_task.abort();
        }

        let Some(this) = weak.upgrade() else {
            token.cancel();
            return TaskOutcome::NotApplied;
        };

        let slot = if ready {
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                slot = this.executors.analysis_slot() => slot.ok(),
            }
        } else {
            None
        };

        // Checked under the callbacks lock, which cancel_analysis also holds
        // while signalling, so a callback is either cancelled or running.
        let started = slot.is_some()
            && this
                .callbacks
                .update(&callback_id, |record| {
                    if record.cancel.is_cancelled() {
                        return false;
                    }
                    record.status = AnalysisStatus::Running;
                    true
                })
                .unwrap_or(false);

        if !started {
            this.callbacks.update(&callback_id, |record| {
                record.status = AnalysisStatus::Cancelled;
            });
            token.cancel();
            info!(
                experiment_id = %this.id,
                callback_id = %callback_id,
                callback = callback.name(),
                "Analysis callback was cancelled before it ran"
            );
            return TaskOutcome::NotApplied;
        }

        debug!(
            experiment_id = %this.id,
            callback_id = %callback_id,
            callback = callback.name(),
            "Running analysis callback"
        );
        let run = AssertUnwindSafe(callback.run(this.clone(), kwargs)).catch_unwind();
        let result = scope_callback(callback_id.clone(), run).await;
        drop(slot);

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic)),
        };
        let outcome = match failure {
            None => {
                this.callbacks.update(&callback_id, |record| {
                    record.status = AnalysisStatus::Done;
                });
                debug!(
                    experiment_id = %this.id,
                    callback_id = %callback_id,
                    "Analysis callback finished"
                );
                TaskOutcome::Done
            }
            Some(message) => {
                let error_msg = format!(
                    "Analysis callback failed [Experiment ID: {}][Analysis Callback ID: {}]: {}",
                    this.id, callback_id, message
                );
                error!(
                    experiment_id = %this.id,
                    callback_id = %callback_id,
                    callback = callback.name(),
                    error = %message,
                    "Analysis callback failed"
                );
                this.callbacks.update(&callback_id, |record| {
                    record.status = AnalysisStatus::Error;
                    record.error_msg = Some(error_msg);
                });
                TaskOutcome::NotApplied
            }
        };
        token.cancel();
        outcome
    }

    /// Cancel queued analysis callbacks, newest first.
    ///
    /// With `ids`, only those callbacks are targeted. Running callbacks
    /// cannot be interrupted and make the result `false`; the others are
    /// waited on for the configured cancel wait and dropped from tracking
    /// once settled.
    pub async fn cancel_analysis(&self, ids: Option<&[String]>) -> bool {
        let (mut all_cancelled, signalled) = {
            let futures = self.analysis_futures.lock();
            let callbacks = self.callbacks.lock();
            let mut all_cancelled = true;
            let mut signalled = Vec::new();
            for (callback_id, record) in callbacks.iter().rev() {
                if ids.is_some_and(|ids| !ids.contains(callback_id)) {
                    continue;
                }
                record.cancel.cancel();
                if record.status == AnalysisStatus::Running {
                    warn!(
                        experiment_id = %self.id,
                        callback_id = %callback_id,
                        "Unable to cancel running analysis callback"
                    );
                    all_cancelled = false;
                } else if let Some(handle) = futures.get(callback_id) {
                    signalled.push((callback_id.clone(), handle.clone()));
                }
            }
            (all_cancelled, signalled)
        };

        let handles: Vec<TaskHandle> = signalled.iter().map(|(_, h)| h.clone()).collect();
        wait_for_tasks(&handles, Some(self.cancel_wait), "cancelled analysis", &self.id).await;

        let mut futures = self.analysis_futures.lock();
        for (callback_id, handle) in &signalled {
            match handle.outcome() {
                Some(outcome) if !outcome.is_failure() => {
                    futures.remove(callback_id);
                }
                _ => all_cancelled = false,
            }
        }
        all_cancelled
    }

    /// Cancel every queued analysis callback and every running job.
    pub async fn cancel(&self) -> bool {
        let analysis = self.cancel_analysis(None).await;
        let jobs = self.cancel_jobs(None).await;
        analysis && jobs
    }

    /// Wait for jobs and analysis callbacks to finish.
    ///
    /// Tasks registered while waiting are waited on too. Finished tasks
    /// that did not fail are dropped from tracking. From inside an analysis
    /// callback only jobs are waited on.
    pub async fn block_for_results(&self, timeout: Option<Duration>) -> &Self {
        let deadline = timeout.map(|t| Instant::now() + t);
        let include_analysis = !in_analysis_callback();
        if !include_analysis {
            debug!(
                experiment_id = %self.id,
                "Waiting from inside an analysis callback, only jobs are waited on"
            );
        }

        loop {
            let jobs = self.job_futures.items();
            let analysis = if include_analysis {
                self.analysis_futures.items()
            } else {
                Vec::new()
            };

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let job_handles: Vec<TaskHandle> = jobs.iter().map(|(_, h)| h.clone()).collect();
            wait_for_tasks(&job_handles, remaining, "jobs", &self.id).await;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let analysis_handles: Vec<TaskHandle> =
                analysis.iter().map(|(_, h)| h.clone()).collect();
            wait_for_tasks(&analysis_handles, remaining, "analysis callbacks", &self.id).await;

            {
                let mut futures = self.job_futures.lock();
                for (id, handle) in &jobs {
                    if handle.outcome().is_some_and(|o| !o.is_failure()) {
                        futures.remove(id);
                    }
                }
            }
            {
                let mut futures = self.analysis_futures.lock();
                for (id, handle) in &analysis {
                    if handle.outcome().is_some_and(|o| !o.is_failure()) {
                        futures.remove(id);
                    }
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let new_jobs = self
                .job_futures
                .keys()
                .iter()
                .any(|id| !jobs.iter().any(|(seen, _)| seen == id));
            let new_analysis = include_analysis
                && self
                    .analysis_futures
                    .keys()
                    .iter()
                    .any(|id| !analysis.iter().any(|(seen, _)| seen == id));
            if !new_jobs && !new_analysis {
                break;
            }
        }
        self
    }

    /// Warn if new jobs or data arrive while analysis is still pending.
    pub(crate) fn warn_if_analysis_pending(&self, what: &str) {
        let pending = self
            .analysis_futures
            .lock()
            .values()
            .any(|handle| !handle.is_finished());
        if pending {
            warn!(
                experiment_id = %self.id,
                "Not all analysis has finished running. Adding new {what} may create unexpected analysis results"
            );
        }
    }
}
