//! Remote persistence of experiments, figures and analysis results.
//!
//! This module defines the [`ExperimentService`] trait the container saves
//! to and loads from. Two implementations ship with the crate:
//!
//! - [`MemoryService`]: in-process storage (no persistence)
//! - [`JsonFileService`]: one JSON document per entity under a directory

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::analysis_result::AnalysisResult;

pub mod json;
pub mod memory;

pub use json::JsonFileService;
pub use memory::MemoryService;

/// Errors reported by an experiment service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The entry does not exist.
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// The entry already exists.
    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    /// The request failed.
    #[error("Request failed: {0}")]
    Request(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Preferences a service advertises to the experiments bound to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// Whether experiments should save every change immediately.
    #[serde(default)]
    pub auto_save: bool,
}

/// Experiment-level record as stored by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Experiment id.
    pub experiment_id: String,
    /// Experiment type.
    pub experiment_type: String,
    /// Name of the backend the experiment ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_name: Option<String>,
    /// Provider of the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Parent experiment id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ids of the jobs run for the experiment.
    #[serde(default)]
    pub job_ids: Vec<String>,
    /// Share level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_level: Option<String>,
    /// Notes.
    #[serde(default)]
    pub notes: String,
    /// Metadata, including the `_source` provenance entry.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Names of the figures stored for the experiment (maintained by the
    /// service).
    #[serde(default)]
    pub figure_names: Vec<String>,
    /// Extension entries.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ExperimentRecord {
    /// Apply the mutable fields of `update` to this record.
    ///
    /// Type, backend and provider are fixed at creation.
    pub fn apply_update(&mut self, update: &ExperimentRecord) {
        self.parent_id.clone_from(&update.parent_id);
        self.tags.clone_from(&update.tags);
        self.job_ids.clone_from(&update.job_ids);
        if update.share_level.is_some() {
            self.share_level.clone_from(&update.share_level);
        }
        self.notes.clone_from(&update.notes);
        self.metadata.clone_from(&update.metadata);
        self.extra.clone_from(&update.extra);
    }
}

/// A remote database of experiments.
#[async_trait]
pub trait ExperimentService: Send + Sync {
    /// Preferences advertised by this service.
    fn options(&self) -> ServiceOptions {
        ServiceOptions::default()
    }

    /// Base URL under which experiments can be browsed.
    fn web_interface_link(&self) -> Option<String> {
        None
    }

    /// Create an experiment; fails with `AlreadyExists` if present.
    async fn create_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()>;

    /// Update an experiment; fails with `NotFound` if absent.
    async fn update_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()>;

    /// Fetch an experiment.
    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord>;

    /// Create a figure; fails with `AlreadyExists` if present.
    async fn create_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()>;

    /// Replace a figure; fails with `NotFound` if absent.
    async fn update_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()>;

    /// Fetch a figure.
    async fn figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<Vec<u8>>;

    /// Delete a figure.
    async fn delete_figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<()>;

    /// Create an analysis result; fails with `AlreadyExists` if present.
    async fn create_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()>;

    /// Update an analysis result; fails with `NotFound` if absent.
    async fn update_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()>;

    /// Analysis results of an experiment, oldest first, at most `limit`.
    async fn analysis_results(
        &self,
        experiment_id: &str,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<AnalysisResult>>;

    /// Delete an analysis result.
    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()>;
}

/// Attempts an upsert makes before giving up on flip-flopping existence.
const UPSERT_ATTEMPTS: usize = 3;

/// An entity written with [`upsert`].
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    /// Experiment record.
    Experiment(&'a ExperimentRecord),
    /// Figure bytes.
    Figure {
        /// Owning experiment.
        experiment_id: &'a str,
        /// Figure name.
        name: &'a str,
        /// Encoded image.
        bytes: &'a [u8],
    },
    /// Analysis result.
    AnalysisResult(&'a AnalysisResult),
}

impl Entry<'_> {
    async fn create(&self, service: &dyn ExperimentService) -> ServiceResult<()> {
        match *self {
            Entry::Experiment(record) => service.create_experiment(record).await,
            Entry::Figure {
                experiment_id,
                name,
                bytes,
            } => service.create_figure(experiment_id, name, bytes).await,
            Entry::AnalysisResult(result) => service.create_analysis_result(result).await,
        }
    }

    async fn update(&self, service: &dyn ExperimentService) -> ServiceResult<()> {
        match *self {
            Entry::Experiment(record) => service.update_experiment(record).await,
            Entry::Figure {
                experiment_id,
                name,
                bytes,
            } => service.update_figure(experiment_id, name, bytes).await,
            Entry::AnalysisResult(result) => service.update_analysis_result(result).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Entry::Experiment(record) => format!("experiment {}", record.experiment_id),
            Entry::Figure { name, .. } => format!("figure {name}"),
            Entry::AnalysisResult(result) => format!("analysis result {}", result.result_id),
        }
    }
}

/// Write `entry`, creating or updating as needed.
///
/// Starts with a create when `is_new`, otherwise with an update, and
/// switches when the service reports the entry already exists or is missing.
pub async fn upsert(
    service: &dyn ExperimentService,
    entry: Entry<'_>,
    is_new: bool,
) -> ServiceResult<()> {
    let mut is_new = is_new;
    for _ in 0..UPSERT_ATTEMPTS {
        let outcome = if is_new {
            entry.create(service).await
        } else {
            entry.update(service).await
        };
        match outcome {
            Err(ServiceError::AlreadyExists(_)) if is_new => {
                debug!(entry = %entry.describe(), "Entry exists, switching to update");
                is_new = false;
            }
            Err(ServiceError::NotFound(_)) if !is_new => {
                debug!(entry = %entry.describe(), "Entry missing, switching to create");
                is_new = true;
            }
            other => return other,
        }
    }
    Err(ServiceError::Request(format!(
        "unable to determine whether {} exists",
        entry.describe()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_falls_back() {
        let service = MemoryService::new();
        let record = ExperimentRecord {
            experiment_id: "e1".into(),
            experiment_type: "Rabi".into(),
            ..Default::default()
        };

        // Update of a missing entry creates it.
        upsert(&service, Entry::Experiment(&record), false).await.unwrap();
        assert!(service.experiment("e1").await.is_ok());

        // Create of an existing entry updates it.
        let updated = ExperimentRecord {
            notes: "second".into(),
            ..record.clone()
        };
        upsert(&service, Entry::Experiment(&updated), true).await.unwrap();
        assert_eq!(service.experiment("e1").await.unwrap().notes, "second");
    }

    #[test]
    fn test_apply_update_keeps_identity() {
        let mut stored = ExperimentRecord {
            experiment_id: "e1".into(),
            experiment_type: "Rabi".into(),
            backend_name: Some("fake".into()),
            share_level: Some("project".into()),
            ..Default::default()
        };
        let update = ExperimentRecord {
            experiment_id: "e1".into(),
            experiment_type: "Other".into(),
            tags: vec!["a".into()],
            ..Default::default()
        };
        stored.apply_update(&update);

        assert_eq!(stored.experiment_type, "Rabi");
        assert_eq!(stored.backend_name.as_deref(), Some("fake"));
        assert_eq!(stored.share_level.as_deref(), Some("project"));
        assert_eq!(stored.tags, vec!["a".to_string()]);
    }
}
