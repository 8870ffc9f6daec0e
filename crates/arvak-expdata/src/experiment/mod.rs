//! The experiment data container.
//!
//! [`ExperimentData`] is the aggregate root of one experiment: its jobs, the
//! raw records extracted from them, queued analysis callbacks, analysis
//! results and figures, plus the bookkeeping needed to persist all of it to
//! an [`ExperimentService`].
//!
//! Containers are always handled through `Arc<ExperimentData>`: background
//! tasks hold weak references back to the container that spawned them.
//!
//! Every collection sits behind its own lock. Operations that take more
//! than one lock acquire them in this order:
//!
//! ```text
//! data → job_futures → analysis_futures → callbacks
//! ```
//!
//! No lock is held across an await.

mod analysis;
mod copy;
mod figures;
mod jobs;
mod persistence;
mod report;
mod results;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arvak_hal::{Backend, Job, JobId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analysis_result::AnalysisResult;
use crate::callback::AnalysisCallback;
use crate::config::ExperimentConfig;
use crate::containers::{ThreadSafeList, ThreadSafeOrderedMap};
use crate::error::{ExpDataError, ExpDataResult};
use crate::figure::Figure;
use crate::record::Datum;
use crate::registry::ServiceRegistry;
use crate::service::ExperimentService;
use crate::task::{Executors, TaskHandle};

pub use results::{ResultKey, ResultQuery};

/// Version of the metadata layout written to the service.
pub const METADATA_VERSION: u32 = 1;

/// Metadata key holding the provenance record.
pub const SOURCE_KEY: &str = "_source";

/// Provenance of an experiment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Type that produced the record.
    #[serde(rename = "class")]
    pub class_name: String,
    /// Metadata layout version.
    pub metadata_version: u32,
    /// Version of the library that produced the record.
    pub library_version: String,
}

impl Default for SourceInfo {
    fn default() -> Self {
        Self {
            class_name: "arvak_expdata::ExperimentData".to_string(),
            metadata_version: METADATA_VERSION,
            library_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Scalar attributes edited through setters.
#[derive(Debug, Clone, Default)]
pub(crate) struct Annotations {
    pub(crate) tags: Vec<String>,
    pub(crate) share_level: Option<String>,
    pub(crate) notes: String,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) extra: Map<String, Value>,
}

/// Sort and deduplicate tags.
fn unique_tags(mut tags: Vec<String>) -> Vec<String> {
    tags.sort();
    tags.dedup();
    tags
}

/// Experiment data: jobs, raw records, analysis and figures of one
/// experiment.
pub struct ExperimentData {
    pub(crate) id: String,
    pub(crate) parent_id: Option<String>,
    pub(crate) experiment_type: String,
    pub(crate) source: SourceInfo,

    pub(crate) backend: RwLock<Option<Arc<dyn Backend>>>,
    pub(crate) service: OnceLock<Arc<dyn ExperimentService>>,
    pub(crate) registry: Option<Arc<ServiceRegistry>>,
    pub(crate) executors: Executors,
    pub(crate) cancel_wait: Duration,

    pub(crate) annotations: RwLock<Annotations>,
    pub(crate) auto_save: AtomicBool,
    pub(crate) created_in_db: AtomicBool,

    pub(crate) jobs: ThreadSafeOrderedMap<JobId, Option<Arc<dyn Job>>>,
    pub(crate) job_futures: ThreadSafeOrderedMap<JobId, TaskHandle>,
    pub(crate) data: ThreadSafeList<Datum>,
    pub(crate) callbacks: ThreadSafeOrderedMap<String, AnalysisCallback>,
    pub(crate) analysis_futures: ThreadSafeOrderedMap<String, TaskHandle>,
    pub(crate) analysis_results: ThreadSafeOrderedMap<String, AnalysisResult>,
    pub(crate) figures: ThreadSafeOrderedMap<String, Option<Figure>>,
    pub(crate) deleted_figures: ThreadSafeList<String>,
    pub(crate) deleted_results: ThreadSafeList<String>,
}

impl ExperimentData {
    /// Start building a new experiment.
    pub fn builder() -> ExperimentDataBuilder {
        ExperimentDataBuilder::default()
    }

    /// Create an empty experiment of `experiment_type` on the current
    /// runtime.
    pub fn new(experiment_type: impl Into<String>) -> ExpDataResult<Arc<Self>> {
        Self::builder().experiment_type(experiment_type).build()
    }

    // ---------------------------------------------------------------------
    // Identity and collaborators
    // ---------------------------------------------------------------------

    /// Experiment id.
    pub fn experiment_id(&self) -> &str {
        &self.id
    }

    /// Id of the parent experiment.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Experiment type.
    pub fn experiment_type(&self) -> &str {
        &self.experiment_type
    }

    /// Provenance record.
    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    /// Backend the experiment runs on.
    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        read(&self.backend).clone()
    }

    /// Provider of the backend.
    pub fn provider(&self) -> Option<String> {
        self.backend().and_then(|b| b.provider().map(str::to_string))
    }

    /// Bound experiment service.
    pub fn service(&self) -> Option<Arc<dyn ExperimentService>> {
        self.service.get().cloned()
    }

    /// The worker pools of this experiment.
    pub fn executors(&self) -> &Executors {
        &self.executors
    }

    /// Whether changes are saved automatically.
    pub fn auto_save(&self) -> bool {
        self.auto_save.load(Ordering::SeqCst)
    }

    /// Whether the experiment has been created in the service.
    pub fn created_in_db(&self) -> bool {
        self.created_in_db.load(Ordering::SeqCst)
    }

    /// Adopt the service registered for `backend`'s provider.
    ///
    /// Does nothing if a service is already bound.
    pub(crate) fn adopt_provider_service(&self, backend: &Arc<dyn Backend>) {
        if self.service.get().is_some() {
            return;
        }
        let Some(provider) = backend.provider() else {
            return;
        };
        let Some(service) = self
            .registry
            .as_ref()
            .and_then(|registry| registry.service_for(provider))
        else {
            return;
        };
        let auto_save = service.options().auto_save;
        if self.service.set(service).is_ok() {
            debug!(
                experiment_id = %self.id,
                provider,
                "Using experiment service of backend provider"
            );
            self.auto_save.store(auto_save, Ordering::SeqCst);
        }
    }

    // ---------------------------------------------------------------------
    // Scalar attributes
    // ---------------------------------------------------------------------

    /// Tags, sorted and without duplicates.
    pub fn tags(&self) -> Vec<String> {
        read(&self.annotations).tags.clone()
    }

    /// Replace the tags; duplicates are dropped.
    pub async fn set_tags(&self, tags: Vec<String>) {
        write(&self.annotations).tags = unique_tags(tags);
        self.after_mutation().await;
    }

    /// Share level.
    pub fn share_level(&self) -> Option<String> {
        read(&self.annotations).share_level.clone()
    }

    /// Set the share level.
    pub async fn set_share_level(&self, share_level: impl Into<String>) {
        write(&self.annotations).share_level = Some(share_level.into());
        self.after_mutation().await;
    }

    /// Notes.
    pub fn notes(&self) -> String {
        read(&self.annotations).notes.clone()
    }

    /// Replace the notes.
    pub async fn set_notes(&self, notes: impl Into<String>) {
        write(&self.annotations).notes = notes.into();
        self.after_mutation().await;
    }

    /// Metadata (without the provenance entry).
    pub fn metadata(&self) -> Map<String, Value> {
        read(&self.annotations).metadata.clone()
    }

    /// Edit the metadata in place.
    pub async fn update_metadata(&self, edit: impl FnOnce(&mut Map<String, Value>)) {
        edit(&mut write(&self.annotations).metadata);
        self.after_mutation().await;
    }

    /// Extension entries supplied at construction.
    pub fn extra(&self) -> Map<String, Value> {
        read(&self.annotations).extra.clone()
    }

    /// One extension entry.
    pub fn extra_value(&self, key: &str) -> Option<Value> {
        read(&self.annotations).extra.get(key).cloned()
    }

    /// Set one extension entry.
    pub fn set_extra(&self, key: impl Into<String>, value: Value) {
        write(&self.annotations).extra.insert(key.into(), value);
    }

    /// Save metadata if auto-save is on. Run by every mutating operation.
    pub(crate) async fn after_mutation(&self) {
        if self.auto_save() {
            self.save_metadata().await;
        }
    }

    // ---------------------------------------------------------------------
    // Collections
    // ---------------------------------------------------------------------

    /// Ids of the experiment's jobs, in the order they were added.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys()
    }

    /// Job handles known locally.
    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        self.jobs.lock().values().flatten().cloned().collect()
    }

    /// Names of the figures, in insertion order.
    pub fn figure_names(&self) -> Vec<String> {
        self.figures.keys()
    }

    /// Number of raw data records.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Callback records, in registration order.
    pub fn analysis_callbacks(&self) -> Vec<AnalysisCallback> {
        self.callbacks.values()
    }

    /// Ids of callbacks whose execution task is still tracked.
    pub fn pending_analysis_ids(&self) -> Vec<String> {
        self.analysis_futures.keys()
    }

    /// Ids of jobs whose extraction task is still tracked.
    pub fn pending_job_ids(&self) -> Vec<JobId> {
        self.job_futures.keys()
    }

    /// Figure names queued for remote deletion.
    pub fn pending_figure_deletions(&self) -> Vec<String> {
        self.deleted_figures.snapshot()
    }

    /// Result ids queued for remote deletion.
    pub fn pending_result_deletions(&self) -> Vec<String> {
        self.deleted_results.snapshot()
    }
}

impl fmt::Display for ExperimentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExperimentData({}, {}", self.experiment_type, self.id)?;
        if let Some(parent) = &self.parent_id {
            write!(f, ", parent_id={parent}")?;
        }
        let annotations = read(&self.annotations);
        if !annotations.tags.is_empty() {
            write!(f, ", tags={:?}", annotations.tags)?;
        }
        let job_ids = self.job_ids();
        if !job_ids.is_empty() {
            let ids: Vec<&str> = job_ids.iter().map(JobId::as_str).collect();
            write!(f, ", job_ids={ids:?}")?;
        }
        if let Some(level) = &annotations.share_level {
            write!(f, ", share_level={level}")?;
        }
        if !annotations.metadata.is_empty() {
            write!(f, ", metadata=<{} items>", annotations.metadata.len())?;
        }
        let figure_names = self.figure_names();
        if !figure_names.is_empty() {
            write!(f, ", figure_names={figure_names:?}")?;
        }
        if !annotations.notes.is_empty() {
            write!(f, ", notes={}", annotations.notes)?;
        }
        for (key, value) in &annotations.extra {
            write!(f, ", {key}={value}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for ExperimentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentData")
            .field("id", &self.id)
            .field("experiment_type", &self.experiment_type)
            .field("jobs", &self.jobs.len())
            .field("data", &self.data.len())
            .field("callbacks", &self.callbacks.len())
            .field("analysis_results", &self.analysis_results.len())
            .field("figures", &self.figures.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`ExperimentData`].
#[derive(Default)]
pub struct ExperimentDataBuilder {
    experiment_type: Option<String>,
    backend: Option<Arc<dyn Backend>>,
    service: Option<Arc<dyn ExperimentService>>,
    registry: Option<Arc<ServiceRegistry>>,
    experiment_id: Option<String>,
    parent_id: Option<String>,
    tags: Vec<String>,
    job_ids: Vec<JobId>,
    share_level: Option<String>,
    metadata: Map<String, Value>,
    figure_names: Vec<String>,
    notes: String,
    extra: Map<String, Value>,
    config: Option<ExperimentConfig>,
    executors: Option<Executors>,
    cancel_wait: Option<Duration>,
}

impl ExperimentDataBuilder {
    /// Experiment type (default `"Unknown"`).
    pub fn experiment_type(mut self, experiment_type: impl Into<String>) -> Self {
        self.experiment_type = Some(experiment_type.into());
        self
    }

    /// Backend the experiment runs on.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Experiment service to persist to.
    pub fn service(mut self, service: Arc<dyn ExperimentService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Registry used to find the service of a backend's provider.
    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Experiment id (generated if not set).
    pub fn experiment_id(mut self, id: impl Into<String>) -> Self {
        self.experiment_id = Some(id.into());
        self
    }

    /// Parent experiment id.
    pub fn parent_id(mut self, id: impl Into<String>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    /// Tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Ids of jobs whose handles are not available locally.
    pub fn job_ids(mut self, ids: impl IntoIterator<Item = impl Into<JobId>>) -> Self {
        self.job_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Share level.
    pub fn share_level(mut self, level: impl Into<String>) -> Self {
        self.share_level = Some(level.into());
        self
    }

    /// Metadata; a `_source` entry becomes the provenance record.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Names of figures stored remotely (fetched on first access).
    pub fn figure_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.figure_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Notes.
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Extension entry.
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Extension entries.
    pub fn extras(mut self, extra: Map<String, Value>) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Configuration (defaults if not set).
    pub fn config(mut self, config: ExperimentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Worker pools (created on the current runtime if not set).
    pub fn executors(mut self, executors: Executors) -> Self {
        self.executors = Some(executors);
        self
    }

    pub(crate) fn cancel_wait(mut self, wait: Duration) -> Self {
        self.cancel_wait = Some(wait);
        self
    }

    /// Build the experiment.
    ///
    /// Fails if no executors were given and there is no ambient tokio
    /// runtime, or if the `_source` metadata entry is malformed.
    pub fn build(self) -> ExpDataResult<Arc<ExperimentData>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let executors = match self.executors {
            Some(executors) => executors,
            None => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                    ExpDataError::InvalidArgument(format!("no tokio runtime available: {e}"))
                })?;
                Executors::new(runtime, config.analysis_workers)
            }
        };

        let mut metadata = self.metadata;
        let source = match metadata.remove(SOURCE_KEY) {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                ExpDataError::InvalidArgument(format!("malformed {SOURCE_KEY} metadata: {e}"))
            })?,
            None => SourceInfo::default(),
        };

        let jobs = ThreadSafeOrderedMap::new();
        for id in self.job_ids {
            jobs.insert(id, None);
        }
        let figures = ThreadSafeOrderedMap::new();
        for name in self.figure_names {
            figures.insert(name, None);
        }

        let service = OnceLock::new();
        if let Some(s) = self.service {
            let _ = service.set(s);
        }

        let expdata = Arc::new(ExperimentData {
            id: self
                .experiment_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            parent_id: self.parent_id,
            experiment_type: self.experiment_type.unwrap_or_else(|| "Unknown".to_string()),
            source,
            backend: RwLock::new(None),
            service,
            registry: self.registry,
            executors,
            cancel_wait: self.cancel_wait.unwrap_or_else(|| config.cancel_wait()),
            annotations: RwLock::new(Annotations {
                tags: unique_tags(self.tags),
                share_level: self.share_level,
                notes: self.notes,
                metadata,
                extra: self.extra,
            }),
            auto_save: AtomicBool::new(false),
            created_in_db: AtomicBool::new(false),
            jobs,
            job_futures: ThreadSafeOrderedMap::new(),
            data: ThreadSafeList::new(),
            callbacks: ThreadSafeOrderedMap::new(),
            analysis_futures: ThreadSafeOrderedMap::new(),
            analysis_results: ThreadSafeOrderedMap::new(),
            figures,
            deleted_figures: ThreadSafeList::new(),
            deleted_results: ThreadSafeList::new(),
        });

        if let Some(backend) = self.backend {
            expdata.adopt_provider_service(&backend);
            *write(&expdata.backend) = Some(backend);
        }
        // The configured flag wins over a provider preference at construction.
        expdata.auto_save.store(config.auto_save, Ordering::SeqCst);

        debug!(
            experiment_id = %expdata.id,
            experiment_type = %expdata.experiment_type,
            "Created experiment data"
        );
        if expdata.auto_save() && expdata.service().is_none() {
            warn!(
                experiment_id = %expdata.id,
                "Auto-save requested but no experiment service is bound"
            );
        }
        Ok(expdata)
    }
}
