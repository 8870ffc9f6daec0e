//! Saving to and loading from an experiment service.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arvak_hal::{Backend, JobId};
use tracing::{debug, info, warn};

use super::{ExperimentData, SOURCE_KEY, read};
use crate::error::{ExpDataError, ExpDataResult};
use crate::service::{Entry, ExperimentRecord, ExperimentService, ServiceError, upsert};

impl ExperimentData {
    /// Bind the experiment service.
    ///
    /// A service can be bound once. The experiment adopts the service's
    /// auto-save preference, which saves everything if it turns auto-save
    /// on.
    pub async fn set_service(&self, service: Arc<dyn ExperimentService>) -> ExpDataResult<()> {
        let auto_save = service.options().auto_save;
        self.service
            .set(service)
            .map_err(|_| ExpDataError::ServiceAlreadySet)?;
        debug!(experiment_id = %self.id, "Bound experiment service");
        self.set_auto_save(auto_save).await;
        Ok(())
    }

    /// Turn auto-save on or off. Turning it on saves everything first.
    pub async fn set_auto_save(&self, auto_save: bool) {
        if auto_save && !self.auto_save() {
            self.save().await;
        }
        self.auto_save.store(auto_save, Ordering::SeqCst);
    }

    /// The experiment-level record written to the service.
    pub fn experiment_record(&self) -> ExperimentRecord {
        let annotations = read(&self.annotations).clone();
        let mut metadata = annotations.metadata;
        if let Ok(source) = serde_json::to_value(&self.source) {
            metadata.insert(SOURCE_KEY.to_string(), source);
        }
        let backend = self.backend();
        ExperimentRecord {
            experiment_id: self.id.clone(),
            experiment_type: self.experiment_type.clone(),
            backend_name: backend.as_ref().map(|b| b.name().to_string()),
            provider: backend.as_ref().and_then(|b| b.provider().map(str::to_string)),
            parent_id: self.parent_id.clone(),
            tags: annotations.tags,
            job_ids: self.job_ids().into_iter().map(|id| id.0).collect(),
            share_level: annotations.share_level,
            notes: annotations.notes,
            metadata,
            figure_names: self.figure_names(),
            extra: annotations.extra,
        }
    }

    /// Save the experiment-level record.
    ///
    /// Needs a service and a backend; returns whether the record was saved.
    pub async fn save_metadata(&self) -> bool {
        let Some(service) = self.service() else {
            warn!(
                experiment_id = %self.id,
                "Experiment cannot be saved because no experiment service is available"
            );
            return false;
        };
        if self.backend().is_none() {
            warn!(
                experiment_id = %self.id,
                "Experiment cannot be saved because backend is missing"
            );
            return false;
        }

        let record = self.experiment_record();
        match upsert(service.as_ref(), Entry::Experiment(&record), !self.created_in_db()).await {
            Ok(()) => {
                self.created_in_db.store(true, Ordering::SeqCst);
                debug!(experiment_id = %self.id, "Saved experiment metadata");
                true
            }
            Err(e) => {
                warn!(experiment_id = %self.id, error = %e, "Experiment service operation failed");
                false
            }
        }
    }

    /// Save metadata, analysis results and figures, and send queued
    /// deletions.
    ///
    /// Remote failures are logged and leave the affected entries queued
    /// for the next save. Returns whether everything was saved.
    pub async fn save(&self) -> bool {
        let Some(service) = self.service() else {
            warn!(
                experiment_id = %self.id,
                "Experiment cannot be saved because no experiment service is available"
            );
            return false;
        };

        let mut complete = self.save_metadata().await;
        if !self.created_in_db() {
            warn!(
                experiment_id = %self.id,
                "Could not save experiment metadata to DB, aborting experiment save"
            );
            return false;
        }

        for result in self.analysis_results.values() {
            complete &= self.upload_result(&result).await;
        }
        for result_id in self.deleted_results.snapshot() {
            match service.delete_analysis_result(&result_id).await {
                Ok(()) | Err(ServiceError::NotFound(_)) => {
                    self.deleted_results.lock().retain(|queued| queued != &result_id);
                }
                Err(e) => {
                    warn!(
                        experiment_id = %self.id,
                        result_id = %result_id,
                        error = %e,
                        "Experiment service operation failed"
                    );
                    complete = false;
                }
            }
        }

        for (name, figure) in self.figures.items() {
            // Figures known only by name are already stored remotely.
            let Some(figure) = figure else {
                continue;
            };
            complete &= self.upload_figure(&name, &figure, true).await;
        }
        for name in self.deleted_figures.snapshot() {
            match service.delete_figure(&self.id, &name).await {
                Ok(()) | Err(ServiceError::NotFound(_)) => {
                    self.deleted_figures.lock().retain(|queued| queued != &name);
                }
                Err(e) => {
                    warn!(
                        experiment_id = %self.id,
                        figure = %name,
                        error = %e,
                        "Experiment service operation failed"
                    );
                    complete = false;
                }
            }
        }

        if let Some(link) = service.web_interface_link() {
            info!(
                experiment_id = %self.id,
                "You can view the experiment online at {link}/{}",
                self.id
            );
        }
        complete
    }

    /// Load an experiment from `service`.
    ///
    /// Jobs are retrieved from `backend` if given; analysis results are
    /// fetched and figures are downloaded on first access.
    pub async fn load(
        experiment_id: &str,
        service: Arc<dyn ExperimentService>,
        backend: Option<Arc<dyn Backend>>,
    ) -> ExpDataResult<Arc<Self>> {
        let record = service.experiment(experiment_id).await?;
        let mut builder = Self::builder()
            .experiment_id(record.experiment_id)
            .experiment_type(record.experiment_type)
            .tags(record.tags)
            .job_ids(record.job_ids.into_iter().map(JobId::from))
            .notes(record.notes)
            .metadata(record.metadata)
            .figure_names(record.figure_names)
            .extras(record.extra);
        if let Some(parent_id) = record.parent_id {
            builder = builder.parent_id(parent_id);
        }
        if let Some(share_level) = record.share_level {
            builder = builder.share_level(share_level);
        }
        if let Some(backend) = backend {
            builder = builder.backend(backend);
        }

        let expdata = builder.build()?;
        expdata.created_in_db.store(true, Ordering::SeqCst);
        expdata.set_service(service).await?;
        expdata.retrieve_data().await;
        expdata.retrieve_analysis_results(false).await;
        debug!(experiment_id = %expdata.id, "Loaded experiment");
        Ok(expdata)
    }
}
