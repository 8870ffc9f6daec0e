//! Job ingestion: raw records, job registration and result extraction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arvak_hal::{HalResult, Job, JobId, JobResult, JobStatus, same_backend};
use tracing::{debug, error, warn};

use super::{ExperimentData, write};
use crate::error::{ExpDataError, ExpDataResult};
use crate::record::{DataIndex, DataItem, Datum, Validated, record_job_id, records_from_result};
use crate::task::{TaskHandle, TaskOutcome, wait_for_tasks};

/// What happened to one job's result.
pub(crate) enum Ingested {
    /// Records were appended.
    Added,
    /// The job was cancelled or errored; nothing was appended.
    Skipped,
    /// Extraction failed unexpectedly.
    Failed(String),
}

impl From<Ingested> for TaskOutcome {
    fn from(ingested: Ingested) -> Self {
        match ingested {
            Ingested::Added => TaskOutcome::Done,
            Ingested::Skipped => TaskOutcome::NotApplied,
            Ingested::Failed(msg) => TaskOutcome::Failed(msg.into()),
        }
    }
}

impl ExperimentData {
    /// Append raw records.
    ///
    /// Job results are flattened into one record per circuit. The batch is
    /// validated up front; nothing is appended if any item is invalid.
    pub fn add_data(&self, items: impl IntoIterator<Item = DataItem>) -> ExpDataResult<()> {
        self.warn_if_analysis_pending("data");
        let mut records = Vec::new();
        for item in items {
            match item.validate()? {
                Validated::Record(record) => records.push(record),
                Validated::Result(result) => records.extend(records_from_result(&result)?),
            }
        }
        self.append_records(records);
        Ok(())
    }

    /// Append records, registering any job ids they reference.
    fn append_records(&self, records: Vec<Datum>) {
        {
            let mut jobs = self.jobs.lock();
            for job_id in records.iter().filter_map(record_job_id) {
                if !jobs.contains_key(&job_id) {
                    jobs.insert(job_id, None);
                }
            }
        }
        self.data.extend(records);
    }

    /// Append the records of one job result.
    pub fn add_result_data(&self, result: &JobResult) -> HalResult<usize> {
        let records = records_from_result(result)?;
        let added = records.len();
        self.append_records(records);
        Ok(added)
    }

    /// Register jobs and extract their results in the background.
    ///
    /// Jobs already known are skipped. If `timeout` is given, jobs still
    /// running when it elapses are cancelled.
    pub async fn add_jobs(
        self: &Arc<Self>,
        jobs: impl IntoIterator<Item = Arc<dyn Job>>,
        timeout: Option<Duration>,
    ) {
        self.warn_if_analysis_pending("jobs");
        let mut spawned = Vec::new();

        for job in jobs {
            let job_id = job.job_id().clone();
            let job_backend = job.backend();
            {
                let mut backend = write(&self.backend);
                if let Some(current) = backend.as_ref() {
                    if !same_backend(current, &job_backend) {
                        warn!(
                            experiment_id = %self.id,
                            job_id = %job_id,
                            current = current.name(),
                            new = job_backend.name(),
                            "Adding a job from a backend different from the experiment's; \
                             the experiment backend is updated"
                        );
                    }
                }
                *backend = Some(job_backend.clone());
            }
            self.adopt_provider_service(&job_backend);

            let registered = {
                let mut known = self.jobs.lock();
                match known.get_mut(&job_id) {
                    Some(Some(_)) => false,
                    Some(slot) => {
                        *slot = Some(job.clone());
                        true
                    }
                    None => {
                        known.insert(job_id.clone(), Some(job.clone()));
                        true
                    }
                }
            };
            if !registered {
                warn!(experiment_id = %self.id, job_id = %job_id, "Skipping duplicate job");
                continue;
            }

            if let Some(handle) = self.add_job_future(job) {
                spawned.push((job_id, handle));
            }
        }

        if let Some(limit) = timeout {
            if !spawned.is_empty() {
                self.spawn_job_timeout(spawned, limit);
            }
        }
        self.after_mutation().await;
    }

    /// Spawn the background task extracting `job`'s result.
    ///
    /// Returns `None` if the job already has one.
    pub(crate) fn add_job_future(self: &Arc<Self>, job: Arc<dyn Job>) -> Option<TaskHandle> {
        let job_id = job.job_id().clone();
        let mut futures = self.job_futures.lock();
        if futures.contains_key(&job_id) {
            warn!(experiment_id = %self.id, job_id = %job_id, "Job is already being processed");
            return None;
        }
        let weak = Arc::downgrade(self);
        let handle = self.executors.spawn_job_task(Self::add_job_data(weak, job));
        futures.insert(job_id, handle.clone());
        Some(handle)
    }

    async fn add_job_data(weak: Weak<Self>, job: Arc<dyn Job>) -> TaskOutcome {
        let fetched = job.result().await;
        match weak.upgrade() {
            Some(this) => this.ingest_job_result(&job, fetched).await.into(),
            None => TaskOutcome::NotApplied,
        }
    }

    /// Append a fetched job result, or classify why it is unavailable.
    pub(crate) async fn ingest_job_result(
        &self,
        job: &Arc<dyn Job>,
        fetched: HalResult<JobResult>,
    ) -> Ingested {
        let job_id = job.job_id();
        let failure = match fetched.and_then(|result| self.add_result_data(&result)) {
            Ok(records) => {
                debug!(experiment_id = %self.id, job_id = %job_id, records, "Added job data");
                return Ingested::Added;
            }
            Err(e) => e,
        };

        match job.status().await {
            Ok(JobStatus::Cancelled) => {
                warn!(
                    experiment_id = %self.id,
                    job_id = %job_id,
                    "Job was cancelled before completion"
                );
                Ingested::Skipped
            }
            Ok(JobStatus::Error) => {
                let message = job.error_message().await.unwrap_or_default();
                error!(
                    experiment_id = %self.id,
                    job_id = %job_id,
                    error = %message,
                    "Job failed, its data was not added"
                );
                Ingested::Skipped
            }
            _ => {
                warn!(
                    experiment_id = %self.id,
                    job_id = %job_id,
                    error = %failure,
                    "Adding data from job failed"
                );
                Ingested::Failed(format!("job {job_id}: {failure}"))
            }
        }
    }

    /// Cancel the jobs in `spawned` that are still running after `limit`.
    fn spawn_job_timeout(self: &Arc<Self>, spawned: Vec<(JobId, TaskHandle)>, limit: Duration) {
        let weak = Arc::downgrade(self);
        let experiment_id = self.id.clone();
        // Not tracked: the timeout only cancels jobs, it adds no data.
        let _ = self.executors.spawn_job_task(async move {
            let handles: Vec<TaskHandle> = spawned.iter().map(|(_, h)| h.clone()).collect();
            let summary = wait_for_tasks(&handles, Some(limit), "jobs", &experiment_id).await;
            if !summary.timed_out() {
                return TaskOutcome::Done;
            }
            let pending: Vec<JobId> = spawned
                .iter()
                .filter(|(_, h)| !h.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            let Some(this) = weak.upgrade() else {
                return TaskOutcome::NotApplied;
            };
            debug!(
                experiment_id = %this.id,
                jobs = pending.len(),
                "Cancelling jobs that exceeded the timeout"
            );
            if this.cancel_jobs(Some(&pending)).await {
                TaskOutcome::Done
            } else {
                TaskOutcome::NotApplied
            }
        });
    }

    /// Retrieve jobs known only by id from the backend.
    ///
    /// Only runs while no records are present. Finished jobs are ingested
    /// right away, and an unexpected failure stays tracked like a failed
    /// extraction task; the others get an extraction task.
    pub(crate) async fn retrieve_data(self: &Arc<Self>) {
        if !self.data.is_empty() {
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        let missing: Vec<JobId> = self
            .jobs
            .lock()
            .iter()
            .filter(|(_, job)| job.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in missing {
            debug!(experiment_id = %self.id, job_id = %job_id, "Retrieving job from backend");
            let job = match backend.retrieve_job(&job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(
                        experiment_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Unable to retrieve job from backend"
                    );
                    continue;
                }
            };
            let claimed = self
                .jobs
                .update(&job_id, |slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(job.clone());
                    true
                })
                .unwrap_or(false);
            if !claimed {
                continue;
            }

            match job.status().await {
                Ok(status) if status.is_final() => {
                    let fetched = job.result().await;
                    if let Ingested::Failed(message) = self.ingest_job_result(&job, fetched).await {
                        self.record_job_failure(job_id, message).await;
                    }
                }
                _ => {
                    self.add_job_future(job);
                }
            }
        }
    }

    /// Track a failure hit outside an extraction task so `job_errors` reports it.
    async fn record_job_failure(&self, job_id: JobId, message: String) {
        let handle = self
            .executors
            .spawn_job_task(async move { TaskOutcome::from(Ingested::Failed(message)) });
        handle.wait().await;
        let mut futures = self.job_futures.lock();
        if !futures.contains_key(&job_id) {
            futures.insert(job_id, handle);
        }
    }

    /// Raw records selected by `index`.
    ///
    /// Jobs known only by id are retrieved from the backend first.
    pub async fn data(self: &Arc<Self>, index: impl Into<DataIndex>) -> ExpDataResult<Vec<Datum>> {
        let index = index.into();
        self.retrieve_data().await;
        let data = self.data.lock();
        match index {
            DataIndex::All => Ok(data.clone()),
            DataIndex::Position(i) => data
                .get(i)
                .map(|record| vec![record.clone()])
                .ok_or_else(|| {
                    ExpDataError::NotFound(format!("data record {i} ({} records)", data.len()))
                }),
            DataIndex::Range(range) => {
                let end = range.end.min(data.len());
                let start = range.start.min(end);
                Ok(data[start..end].to_vec())
            }
            DataIndex::Job(job_id) => Ok(data
                .iter()
                .filter(|record| record_job_id(record).as_ref() == Some(&job_id))
                .cloned()
                .collect()),
        }
    }

    /// The record at position `i`.
    pub async fn datum(self: &Arc<Self>, i: usize) -> ExpDataResult<Datum> {
        self.data(i)
            .await?
            .pop()
            .ok_or_else(|| ExpDataError::NotFound(format!("data record {i}")))
    }

    /// Cancel jobs, newest first.
    ///
    /// With `ids`, only those jobs are targeted. Returns `false` if any
    /// targeted job failed to cancel; its extraction task stays tracked.
    pub async fn cancel_jobs(&self, ids: Option<&[JobId]>) -> bool {
        let targeted: Vec<(JobId, Option<Arc<dyn Job>>)> = self
            .jobs
            .lock()
            .iter()
            .rev()
            .filter(|(id, _)| ids.is_none_or(|ids| ids.contains(id)))
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect();

        let mut all_cancelled = true;
        for (job_id, job) in targeted {
            if let Some(job) = job {
                let status = job.status().await;
                if !matches!(status, Ok(s) if s.is_final()) {
                    match job.cancel().await {
                        Ok(()) => {
                            debug!(experiment_id = %self.id, job_id = %job_id, "Cancelled job");
                        }
                        Err(e) => {
                            warn!(
                                experiment_id = %self.id,
                                job_id = %job_id,
                                error = %e,
                                "Unable to cancel job"
                            );
                            all_cancelled = false;
                            continue;
                        }
                    }
                }
            }
            self.job_futures.remove(&job_id);
        }
        all_cancelled
    }
}
