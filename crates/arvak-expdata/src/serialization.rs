//! Serialization boundary for experiment data.
//!
//! [`ExperimentSnapshot`] is a plain data projection of an
//! [`ExperimentData`]: live job handles, services and background tasks
//! are left out. Jobs come back as ids without handles.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::analysis_result::AnalysisResult;
use crate::callback::AnalysisCallback;
use crate::error::{ExpDataError, ExpDataResult};
use crate::experiment::{ExperimentData, ExperimentDataBuilder, SourceInfo, read};
use crate::figure::Figure;
use crate::record::Datum;

/// A stored figure; `None` bytes mark a figure held only by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureSnapshot {
    /// Figure name.
    pub name: String,
    /// Image bytes, base64 in JSON.
    #[serde(default, with = "base64_bytes")]
    pub bytes: Option<Vec<u8>>,
}

/// Serializable state of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    /// Experiment id.
    pub experiment_id: String,
    /// Id of the parent experiment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Experiment type.
    pub experiment_type: String,
    /// Sorted, deduplicated tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Share level on the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_level: Option<String>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// User metadata, without the provenance entry.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Provenance of the container.
    pub source: SourceInfo,
    /// Registered job ids, in insertion order.
    #[serde(default)]
    pub job_ids: Vec<String>,
    /// Raw records.
    #[serde(default)]
    pub data: Vec<Datum>,
    /// Figures, in insertion order.
    #[serde(default)]
    pub figures: Vec<FigureSnapshot>,
    /// Analysis results, in insertion order.
    #[serde(default)]
    pub analysis_results: Vec<AnalysisResult>,
    /// Analysis callback records, without their cancellation signals.
    #[serde(default)]
    pub callbacks: Vec<AnalysisCallback>,
    /// Figure names queued for remote deletion.
    #[serde(default)]
    pub deleted_figures: Vec<String>,
    /// Result ids queued for remote deletion.
    #[serde(default)]
    pub deleted_results: Vec<String>,
    /// Whether the experiment record exists on the service.
    #[serde(default)]
    pub created_in_db: bool,
    /// Whether mutations are saved immediately.
    #[serde(default)]
    pub auto_save: bool,
    /// Extension entries.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ExperimentData {
    /// Project the experiment into a snapshot.
    ///
    /// Fails with [`ExpDataError::Outstanding`] while any job extraction or
    /// analysis callback is unfinished.
    pub fn to_snapshot(&self) -> ExpDataResult<ExperimentSnapshot> {
        let mut outstanding: Vec<String> = self
            .job_futures
            .items()
            .into_iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| format!("job {id}"))
            .collect();
        outstanding.extend(
            self.analysis_futures
                .items()
                .into_iter()
                .filter(|(_, handle)| !handle.is_finished())
                .map(|(id, _)| format!("analysis callback {id}")),
        );
        if !outstanding.is_empty() {
            return Err(ExpDataError::Outstanding(format!(
                "block for results before serializing: {}",
                outstanding.join(", ")
            )));
        }

        let mut figures = Vec::new();
        for (name, figure) in self.figures.items() {
            let bytes = match figure {
                Some(figure) => Some(figure.to_bytes()?.to_vec()),
                None => None,
            };
            figures.push(FigureSnapshot { name, bytes });
        }

        let annotations = read(&self.annotations).clone();
        Ok(ExperimentSnapshot {
            experiment_id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            experiment_type: self.experiment_type.clone(),
            tags: annotations.tags,
            share_level: annotations.share_level,
            notes: annotations.notes,
            metadata: annotations.metadata,
            source: self.source.clone(),
            job_ids: self.job_ids().into_iter().map(|id| id.0).collect(),
            data: self.data.snapshot(),
            figures,
            analysis_results: self.analysis_results.values(),
            callbacks: self.callbacks.values(),
            deleted_figures: self.deleted_figures.snapshot(),
            deleted_results: self.deleted_results.snapshot(),
            created_in_db: self.created_in_db(),
            auto_save: self.auto_save(),
            extra: annotations.extra,
        })
    }

    /// Restore an experiment from a snapshot on the current runtime.
    pub fn from_snapshot(snapshot: ExperimentSnapshot) -> ExpDataResult<Arc<Self>> {
        Self::from_snapshot_with(snapshot, Self::builder())
    }

    /// Restore an experiment from a snapshot, with collaborators (backend,
    /// service, executors) taken from `builder`.
    pub fn from_snapshot_with(
        snapshot: ExperimentSnapshot,
        builder: ExperimentDataBuilder,
    ) -> ExpDataResult<Arc<Self>> {
        let mut metadata = snapshot.metadata;
        metadata.insert(
            crate::experiment::SOURCE_KEY.to_string(),
            serde_json::to_value(&snapshot.source)?,
        );
        let mut builder = builder
            .experiment_id(snapshot.experiment_id)
            .experiment_type(snapshot.experiment_type)
            .tags(snapshot.tags)
            .notes(snapshot.notes)
            .metadata(metadata)
            .job_ids(snapshot.job_ids)
            .extras(snapshot.extra);
        if let Some(parent_id) = snapshot.parent_id {
            builder = builder.parent_id(parent_id);
        }
        if let Some(share_level) = snapshot.share_level {
            builder = builder.share_level(share_level);
        }
        let expdata = builder.build()?;

        expdata.data.extend(snapshot.data);
        for figure in snapshot.figures {
            expdata
                .figures
                .insert(figure.name, figure.bytes.map(Figure::image));
        }
        for result in snapshot.analysis_results {
            expdata
                .analysis_results
                .insert(result.result_id.clone(), result);
        }
        for callback in snapshot.callbacks {
            // Finished records keep their signal set, so they stay uncancellable.
            if callback.status.is_final() {
                callback.cancel.cancel();
            }
            expdata
                .callbacks
                .insert(callback.callback_id.clone(), callback);
        }
        expdata.deleted_figures.extend(snapshot.deleted_figures);
        expdata.deleted_results.extend(snapshot.deleted_results);
        expdata
            .created_in_db
            .store(snapshot.created_in_db, Ordering::SeqCst);
        expdata.auto_save.store(snapshot.auto_save, Ordering::SeqCst);
        Ok(expdata)
    }

    /// Serialize the experiment to JSON.
    pub fn to_json(&self) -> ExpDataResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_snapshot()?)?)
    }

    /// Restore an experiment from JSON.
    pub fn from_json(json: &str) -> ExpDataResult<Arc<Self>> {
        Self::from_snapshot(serde_json::from_str(json)?)
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
