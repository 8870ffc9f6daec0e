//! Experiment and analysis states and how they aggregate.
//!
//! An experiment carries many jobs and many analysis callbacks. Their
//! individual states are folded into one coarse [`ExperimentStatus`] by a
//! fixed precedence: the "worst" state present wins.

use std::fmt;

use arvak_hal::JobStatus;
use serde::{Deserialize, Serialize};

/// Coarse status of a whole experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Nothing has been added yet.
    Empty,
    /// Jobs are being initialized.
    Initializing,
    /// Jobs are being validated.
    Validating,
    /// Jobs are queued.
    Queued,
    /// Jobs are running.
    Running,
    /// A job or analysis was cancelled.
    Cancelled,
    /// Jobs finished; analysis is queued or running.
    PostProcessing,
    /// Everything finished successfully.
    Done,
    /// A job or analysis failed.
    Error,
}

impl ExperimentStatus {
    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ExperimentStatus::Empty => "experiment data is empty",
            ExperimentStatus::Initializing => "experiment jobs are being initialized",
            ExperimentStatus::Validating => "experiment jobs are validating",
            ExperimentStatus::Queued => "experiment jobs are queued",
            ExperimentStatus::Running => "experiment jobs is actively running",
            ExperimentStatus::Cancelled => "experiment jobs or analysis has been cancelled",
            ExperimentStatus::PostProcessing => "experiment analysis is actively running",
            ExperimentStatus::Done => "experiment jobs and analysis have successfully run",
            ExperimentStatus::Error => "experiment jobs or analysis incurred an error",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExperimentStatus::Empty => "EMPTY",
            ExperimentStatus::Initializing => "INITIALIZING",
            ExperimentStatus::Validating => "VALIDATING",
            ExperimentStatus::Queued => "QUEUED",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Cancelled => "CANCELLED",
            ExperimentStatus::PostProcessing => "POST_PROCESSING",
            ExperimentStatus::Done => "DONE",
            ExperimentStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// State of one analysis callback.
///
/// ```text
///   Queued ──→ Running ──→ Done
///     │           └──────→ Error
///     └──→ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    /// Waiting for earlier jobs and callbacks.
    Queued,
    /// Executing on an analysis worker.
    Running,
    /// Cancelled before it started.
    Cancelled,
    /// Finished successfully.
    Done,
    /// Raised an error.
    Error,
}

impl AnalysisStatus {
    /// Whether the callback can no longer change state.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Cancelled | AnalysisStatus::Done | AnalysisStatus::Error
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisStatus::Queued => "QUEUED",
            AnalysisStatus::Running => "RUNNING",
            AnalysisStatus::Cancelled => "CANCELLED",
            AnalysisStatus::Done => "DONE",
            AnalysisStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

const JOB_PRECEDENCE: [JobStatus; 6] = [
    JobStatus::Error,
    JobStatus::Cancelled,
    JobStatus::Running,
    JobStatus::Queued,
    JobStatus::Validating,
    JobStatus::Initializing,
];

const ANALYSIS_PRECEDENCE: [AnalysisStatus; 4] = [
    AnalysisStatus::Error,
    AnalysisStatus::Cancelled,
    AnalysisStatus::Running,
    AnalysisStatus::Queued,
];

/// Fold individual job states into one.
///
/// Returns `Done` when there are no jobs.
pub fn aggregate_job_status(statuses: impl IntoIterator<Item = JobStatus>) -> JobStatus {
    let present: Vec<JobStatus> = statuses.into_iter().collect();
    JOB_PRECEDENCE
        .into_iter()
        .find(|s| present.contains(s))
        .unwrap_or(JobStatus::Done)
}

/// Fold individual analysis callback states into one.
///
/// Returns `Done` when there are no callbacks.
pub fn aggregate_analysis_status(
    statuses: impl IntoIterator<Item = AnalysisStatus>,
) -> AnalysisStatus {
    let present: Vec<AnalysisStatus> = statuses.into_iter().collect();
    ANALYSIS_PRECEDENCE
        .into_iter()
        .find(|s| present.contains(s))
        .unwrap_or(AnalysisStatus::Done)
}

/// Experiment status implied by an aggregate job status.
///
/// `None` for `Done`: finished jobs defer to the analysis status.
pub fn experiment_status_from_job(status: JobStatus) -> Option<ExperimentStatus> {
    match status {
        JobStatus::Initializing => Some(ExperimentStatus::Initializing),
        JobStatus::Validating => Some(ExperimentStatus::Validating),
        JobStatus::Queued => Some(ExperimentStatus::Queued),
        JobStatus::Running => Some(ExperimentStatus::Running),
        JobStatus::Cancelled => Some(ExperimentStatus::Cancelled),
        JobStatus::Error => Some(ExperimentStatus::Error),
        JobStatus::Done => None,
    }
}

/// Experiment status implied by an aggregate analysis status.
///
/// `None` while analysis is still queued or running.
pub fn experiment_status_from_analysis(status: AnalysisStatus) -> Option<ExperimentStatus> {
    match status {
        AnalysisStatus::Done => Some(ExperimentStatus::Done),
        AnalysisStatus::Cancelled => Some(ExperimentStatus::Cancelled),
        AnalysisStatus::Error => Some(ExperimentStatus::Error),
        AnalysisStatus::Queued | AnalysisStatus::Running => None,
    }
}
