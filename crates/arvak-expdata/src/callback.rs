//! Analysis callbacks.
//!
//! A callback is user post-processing queued on an experiment. It runs once
//! every job and callback registered before it has finished, receiving the
//! experiment itself plus free-form keyword arguments.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::experiment::ExperimentData;
use crate::status::AnalysisStatus;

/// Keyword arguments passed to an analysis callback.
pub type CallbackKwargs = Map<String, Value>;

/// A post-processing routine run against an experiment.
#[async_trait]
pub trait AnalysisFn: Send + Sync {
    /// Name recorded on the callback record.
    fn name(&self) -> &str;

    /// Run the analysis.
    async fn run(&self, data: Arc<ExperimentData>, kwargs: CallbackKwargs) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`AnalysisFn`].
pub struct FnAnalysis<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> AnalysisFn for FnAnalysis<F>
where
    F: Fn(Arc<ExperimentData>, CallbackKwargs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, data: Arc<ExperimentData>, kwargs: CallbackKwargs) -> anyhow::Result<()> {
        (self.func)(data, kwargs).await
    }
}

/// Wrap a closure as a named analysis callback.
///
/// ```ignore
/// let fit = analysis_fn("fit_rabi", |data, _kwargs| async move {
///     let records = data.data(DataIndex::All).await?;
///     // ...
///     Ok(())
/// });
/// expdata.add_analysis_callback(fit, CallbackKwargs::new());
/// ```
pub fn analysis_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn AnalysisFn>
where
    F: Fn(Arc<ExperimentData>, CallbackKwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnAnalysis {
        name: name.into(),
        func,
    })
}

/// Bookkeeping record for one queued analysis callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCallback {
    /// Callback name.
    pub name: String,
    /// Unique id of this registration.
    pub callback_id: String,
    /// Current state.
    pub status: AnalysisStatus,
    /// Error text if the callback failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Cancellation signal; once cancelled it stays cancelled.
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl AnalysisCallback {
    pub(crate) fn new(name: impl Into<String>, callback_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback_id: callback_id.into(),
            status: AnalysisStatus::Queued,
            error_msg: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether cancellation has been requested for this callback.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

tokio::task_local! {
    static ACTIVE_CALLBACK: String;
}

/// Run `future` marked as executing callback `callback_id`.
pub(crate) async fn scope_callback<F: Future>(callback_id: String, future: F) -> F::Output {
    ACTIVE_CALLBACK.scope(callback_id, future).await
}

/// Id of the analysis callback the current task is executing, if any.
pub fn current_callback_id() -> Option<String> {
    ACTIVE_CALLBACK.try_with(Clone::clone).ok()
}

/// Whether the current task is executing an analysis callback.
pub fn in_analysis_callback() -> bool {
    ACTIVE_CALLBACK.try_with(|_| ()).is_ok()
}
