//! Arvak Experiment Data
//!
//! This crate tracks everything produced while an experiment runs on a
//! quantum backend: the jobs submitted, the raw records extracted from their
//! results, the analysis run on those records, and the resulting analysis
//! results and figures.
//!
//! # Overview
//!
//! - [`ExperimentData`] is the container. Jobs added to it are fetched in
//!   the background; analysis callbacks queue behind the jobs and callbacks
//!   registered before them and run on a bounded pool.
//! - [`ExperimentStatus`] folds job and analysis states into one.
//! - [`ExperimentService`] persists experiments, figures and analysis
//!   results. [`MemoryService`] and [`JsonFileService`] are provided.
//! - [`ExperimentSnapshot`] is the serializable projection of a container.
//!
//! # Example
//!
//! ```ignore
//! use arvak_expdata::{ExperimentData, ResultQuery, analysis_fn, AnalysisResult};
//!
//! let expdata = ExperimentData::new("Rabi")?;
//! expdata.add_jobs([job], None).await;
//!
//! let fit = analysis_fn("fit_rabi", |data, _kwargs| async move {
//!     let records = data.data(DataIndex::All).await?;
//!     let rate = fit_rate(&records)?;
//!     data.add_analysis_results([AnalysisResult::new("rabi_rate", rate)]).await;
//!     Ok(())
//! });
//! expdata.add_analysis_callback(fit, Default::default());
//!
//! let results = expdata.analysis_results(ResultQuery::all()).await?;
//! ```

pub mod analysis_result;
pub mod callback;
pub mod config;
pub mod containers;
pub mod error;
pub mod experiment;
pub mod figure;
pub mod record;
pub mod registry;
pub mod serialization;
pub mod service;
pub mod status;
pub mod task;
pub mod tracing_config;

pub use analysis_result::AnalysisResult;
pub use callback::{
    AnalysisCallback, AnalysisFn, CallbackKwargs, analysis_fn, current_callback_id,
    in_analysis_callback,
};
pub use config::{ConfigError, ExperimentConfig};
pub use containers::{OrderedMap, ThreadSafeList, ThreadSafeOrderedMap};
pub use error::{ExpDataError, ExpDataResult};
pub use experiment::{ExperimentData, ExperimentDataBuilder, ResultKey, ResultQuery, SourceInfo};
pub use figure::{Figure, FigureInput, FigureKey, RenderFigure};
pub use record::{DataIndex, DataItem, Datum};
pub use registry::ServiceRegistry;
pub use serialization::{ExperimentSnapshot, FigureSnapshot};
pub use service::{
    ExperimentRecord, ExperimentService, JsonFileService, MemoryService, ServiceError,
    ServiceOptions,
};
pub use status::{AnalysisStatus, ExperimentStatus};
pub use task::{Executors, TaskHandle, TaskOutcome};
