//! Analysis result entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A named, valued outcome of post-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Unique result id.
    pub result_id: String,
    /// Result name, e.g. `"rabi_rate"`.
    pub name: String,
    /// Result value.
    pub value: Value,
    /// Experiment the result belongs to.
    #[serde(default)]
    pub experiment_id: String,
    /// Device components the result refers to, e.g. `["Q0"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_components: Vec<String>,
    /// Quality assessment (`"good"`, `"bad"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    /// Whether the result was verified by a person.
    #[serde(default)]
    pub verified: bool,
    /// Tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Additional fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    /// Create a result with a fresh id.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            result_id: Uuid::new_v4().to_string(),
            name: name.into(),
            value: value.into(),
            experiment_id: String::new(),
            device_components: Vec::new(),
            quality: None,
            verified: false,
            tags: Vec::new(),
            created_at: Some(Utc::now()),
            extra: Map::new(),
        }
    }

    /// Set the device components.
    pub fn with_device_components(
        mut self,
        components: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.device_components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Set the quality.
    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    /// Copy this result under a new id for another experiment.
    pub fn copy_for(&self, experiment_id: &str) -> Self {
        Self {
            result_id: Uuid::new_v4().to_string(),
            experiment_id: experiment_id.to_string(),
            ..self.clone()
        }
    }
}
