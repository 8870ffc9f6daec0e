//! Status aggregation and error reporting.

use std::sync::Arc;

use arvak_hal::{Job, JobId, JobStatus};
use tracing::warn;

use super::ExperimentData;
use crate::status::{
    AnalysisStatus, ExperimentStatus, aggregate_analysis_status, aggregate_job_status,
    experiment_status_from_analysis, experiment_status_from_job,
};
use crate::task::TaskOutcome;

impl ExperimentData {
    /// Whether nothing has been added to the experiment.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
            && self.jobs.is_empty()
            && self.job_futures.is_empty()
            && self.callbacks.is_empty()
            && self.analysis_futures.is_empty()
            && self.analysis_results.is_empty()
            && self.figures.is_empty()
    }

    /// Overall status: jobs first, then analysis.
    pub async fn status(&self) -> ExperimentStatus {
        if self.is_empty() {
            return ExperimentStatus::Empty;
        }
        if let Some(status) = experiment_status_from_job(self.job_status().await) {
            return status;
        }
        experiment_status_from_analysis(self.analysis_status())
            .unwrap_or(ExperimentStatus::PostProcessing)
    }

    /// Aggregated status of the jobs with a local handle.
    pub async fn job_status(&self) -> JobStatus {
        let mut statuses = Vec::new();
        for (job_id, job) in self.job_handles() {
            match job.status().await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(
                        experiment_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Unable to query job status"
                    );
                }
            }
        }
        aggregate_job_status(statuses)
    }

    /// Aggregated status of the analysis callbacks.
    pub fn analysis_status(&self) -> AnalysisStatus {
        aggregate_analysis_status(self.callbacks.lock().values().map(|record| record.status))
    }

    /// Errors of failed jobs and job extraction tasks, one per line.
    pub async fn job_errors(&self) -> String {
        let mut errors = Vec::new();
        for (job_id, handle) in self.job_futures.items() {
            if let Some(TaskOutcome::Failed(message)) = handle.outcome() {
                errors.push(format!("[Job ID: {job_id}]: {message}"));
            }
        }
        for (job_id, job) in self.job_handles() {
            if matches!(job.status().await, Ok(JobStatus::Error)) {
                let message = job.error_message().await.unwrap_or_default();
                errors.push(format!("[Job ID: {job_id}]: {message}"));
            }
        }
        errors.join("\n")
    }

    /// Errors of failed analysis callbacks, one per line.
    pub fn analysis_errors(&self) -> String {
        let mut errors = Vec::new();
        for (callback_id, handle) in self.analysis_futures.items() {
            if let Some(TaskOutcome::Failed(message)) = handle.outcome() {
                errors.push(format!("[Analysis ID: {callback_id}]: {message}"));
            }
        }
        for (callback_id, record) in self.callbacks.items() {
            if record.status == AnalysisStatus::Error {
                let message = record.error_msg.unwrap_or_default();
                errors.push(format!("[Analysis Callback ID: {callback_id}]: {message}"));
            }
        }
        errors.join("\n")
    }

    /// Job and analysis errors, one per line.
    pub async fn errors(&self) -> String {
        let job_errors = self.job_errors().await;
        let analysis_errors = self.analysis_errors();
        [job_errors, analysis_errors]
            .into_iter()
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn job_handles(&self) -> Vec<(JobId, Arc<dyn Job>)> {
        self.jobs
            .lock()
            .iter()
            .filter_map(|(id, job)| job.clone().map(|job| (id.clone(), job)))
            .collect()
    }
}
