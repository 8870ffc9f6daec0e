//! Copying an experiment.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arvak_hal::JobId;
use tracing::{debug, warn};

use super::{ExperimentData, read, write};
use crate::callback::in_analysis_callback;
use crate::error::{ExpDataError, ExpDataResult};
use crate::figure::FigureInput;
use crate::record::record_job_id;
use crate::task::wait_for_tasks;

impl ExperimentData {
    /// Copy the experiment under a new id.
    ///
    /// Jobs, raw data and annotations are copied; jobs still being
    /// extracted get their own extraction task in the copy. With
    /// `copy_results`, pending analysis is waited on and the analysis
    /// results (under new ids) and figures are copied too. Callbacks are
    /// not copied.
    pub async fn copy(self: &Arc<Self>, copy_results: bool) -> ExpDataResult<Arc<Self>> {
        if copy_results && in_analysis_callback() {
            return Err(ExpDataError::InsideCallback("copy with results"));
        }

        let annotations = read(&self.annotations).clone();
        let mut builder = Self::builder()
            .experiment_type(self.experiment_type.clone())
            .tags(annotations.tags)
            .notes(annotations.notes)
            .metadata(annotations.metadata)
            .extras(annotations.extra)
            .executors(self.executors.clone())
            .cancel_wait(self.cancel_wait);
        if let Some(parent_id) = &self.parent_id {
            builder = builder.parent_id(parent_id.clone());
        }
        if let Some(share_level) = annotations.share_level {
            builder = builder.share_level(share_level);
        }
        if let Some(registry) = &self.registry {
            builder = builder.registry(registry.clone());
        }
        if let Some(service) = self.service() {
            builder = builder.service(service);
        }
        let copied = builder.build()?;
        *write(&copied.backend) = self.backend();
        copied.auto_save.store(self.auto_save(), Ordering::SeqCst);

        for (job_id, job) in self.jobs.items() {
            copied.jobs.insert(job_id, job);
        }
        {
            // Holding the data lock keeps extraction tasks from appending
            // between the copy and the unfinished check.
            let data = self.data.lock();
            copied.data.extend(data.iter().cloned());
            // A job's records are appended in one batch, so a job with
            // records has been extracted even if its task is still exiting.
            let extracted: Vec<JobId> = data.iter().filter_map(record_job_id).collect();
            let unfinished: Vec<_> = self
                .job_futures
                .items()
                .into_iter()
                .filter(|(id, handle)| !handle.is_finished() && !extracted.contains(id))
                .collect();
            for (job_id, _) in unfinished {
                if let Some(Some(job)) = copied.jobs.get(&job_id) {
                    copied.add_job_future(job);
                }
            }
        }
        debug!(experiment_id = %self.id, copy_id = %copied.id, "Copied experiment data");

        if !copy_results {
            return Ok(copied);
        }

        let pending = self.analysis_futures.values();
        wait_for_tasks(&pending, None, "analysis callbacks", &self.id).await;

        let results: Vec<_> = self
            .analysis_results
            .values()
            .iter()
            .map(|result| result.copy_for(&copied.id))
            .collect();
        copied.add_analysis_results(results).await;

        for name in self.figure_names() {
            let figure = match self.figure(name.as_str()).await {
                Ok(figure) => figure,
                Err(e) => {
                    warn!(
                        experiment_id = %self.id,
                        figure = %name,
                        error = %e,
                        "Unable to copy figure"
                    );
                    continue;
                }
            };
            copied
                .add_figures(vec![FigureInput::Figure(figure)], Some(vec![name]), true, None)
                .await?;
        }
        Ok(copied)
    }
}
