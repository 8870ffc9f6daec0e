//! Analysis results.

use std::ops::Range;
use std::time::Duration;

use tracing::{debug, warn};

use super::ExperimentData;
use crate::analysis_result::AnalysisResult;
use crate::callback::in_analysis_callback;
use crate::error::{ExpDataError, ExpDataResult};
use crate::service::{Entry, ServiceError, upsert};
use crate::task::wait_for_tasks;

/// Addresses analysis results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKey {
    /// Position in insertion order.
    Index(usize),
    /// Positions in insertion order.
    Range(Range<usize>),
    /// Result id, or else every result with this name.
    Id(String),
}

impl From<usize> for ResultKey {
    fn from(i: usize) -> Self {
        ResultKey::Index(i)
    }
}

impl From<Range<usize>> for ResultKey {
    fn from(r: Range<usize>) -> Self {
        ResultKey::Range(r)
    }
}

impl From<&str> for ResultKey {
    fn from(id: &str) -> Self {
        ResultKey::Id(id.to_string())
    }
}

impl From<String> for ResultKey {
    fn from(id: String) -> Self {
        ResultKey::Id(id)
    }
}

/// Query for [`ExperimentData::analysis_results`].
#[derive(Debug, Clone)]
pub struct ResultQuery {
    /// Selected results; all if `None`.
    pub key: Option<ResultKey>,
    /// Re-fetch results from the service.
    pub refresh: bool,
    /// Wait for pending analysis first.
    pub block: bool,
    /// Upper bound on the wait.
    pub timeout: Option<Duration>,
}

impl Default for ResultQuery {
    fn default() -> Self {
        Self {
            key: None,
            refresh: false,
            block: true,
            timeout: None,
        }
    }
}

impl ResultQuery {
    /// Every result, waiting for pending analysis.
    pub fn all() -> Self {
        Self::default()
    }

    /// Results selected by `key`.
    pub fn key(key: impl Into<ResultKey>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Re-fetch from the service.
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Wait for pending analysis.
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Bound the wait.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ExperimentData {
    /// Add analysis results.
    ///
    /// Results are attached to this experiment. With auto-save each one is
    /// uploaded right away.
    pub async fn add_analysis_results(&self, results: impl IntoIterator<Item = AnalysisResult>) {
        for mut result in results {
            if result.experiment_id.is_empty() {
                result.experiment_id = self.id.clone();
            }
            self.analysis_results
                .insert(result.result_id.clone(), result.clone());
            debug!(
                experiment_id = %self.id,
                result_id = %result.result_id,
                name = %result.name,
                "Added analysis result"
            );

            if self.auto_save() {
                self.upload_result(&result).await;
            }
        }
        self.after_mutation().await;
    }

    /// Upload one result; failures are logged.
    pub(crate) async fn upload_result(&self, result: &AnalysisResult) -> bool {
        let Some(service) = self.service() else {
            return false;
        };
        match upsert(service.as_ref(), Entry::AnalysisResult(result), true).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    experiment_id = %self.id,
                    result_id = %result.result_id,
                    error = %e,
                    "Experiment service operation failed"
                );
                false
            }
        }
    }

    /// Remove one analysis result and queue its remote deletion.
    ///
    /// A name must match exactly one result.
    pub async fn delete_analysis_result(&self, key: impl Into<ResultKey>) -> ExpDataResult<String> {
        let key = key.into();
        if matches!(key, ResultKey::Range(_)) {
            return Err(ExpDataError::InvalidArgument(
                "a single analysis result must be selected for deletion".to_string(),
            ));
        }
        let mut selected = self
            .analysis_results(ResultQuery::key(key.clone()).block(false))
            .await?;
        let result = match (selected.pop(), selected.is_empty()) {
            (Some(result), true) => result,
            _ => {
                return Err(ExpDataError::InvalidArgument(format!(
                    "{key:?} matches more than one analysis result"
                )));
            }
        };

        let result_id = result.result_id;
        self.analysis_results.remove(&result_id);
        self.deleted_results.push(result_id.clone());
        debug!(experiment_id = %self.id, result_id = %result_id, "Deleted analysis result");

        if self.auto_save() {
            if let Some(service) = self.service() {
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
                    }
                }
            }
        }
        self.after_mutation().await;
        Ok(result_id)
    }

    /// Fetch results from the service if none are loaded or on `refresh`.
    pub(crate) async fn retrieve_analysis_results(&self, refresh: bool) {
        let Some(service) = self.service() else {
            return;
        };
        if !refresh && !self.analysis_results.is_empty() {
            return;
        }
        match service.analysis_results(&self.id, None).await {
            Ok(results) => {
                for result in results {
                    self.analysis_results
                        .insert(result.result_id.clone(), result);
                }
            }
            Err(e) => {
                warn!(experiment_id = %self.id, error = %e, "Unable to retrieve analysis results");
            }
        }
    }

    /// Analysis results selected by `query`.
    ///
    /// By default waits for pending analysis first; from inside an analysis
    /// callback the wait is skipped.
    pub async fn analysis_results(&self, query: ResultQuery) -> ExpDataResult<Vec<AnalysisResult>> {
        if query.block && !in_analysis_callback() {
            let pending: Vec<_> = self.analysis_futures.values();
            wait_for_tasks(&pending, query.timeout, "analysis callbacks", &self.id).await;
        }
        self.retrieve_analysis_results(query.refresh).await;

        let (selected, stored_len) = {
            let stored = self.analysis_results.lock();
            let selected: Vec<AnalysisResult> = match &query.key {
                None => return Ok(stored.values().cloned().collect()),
                Some(ResultKey::Index(i)) => stored
                    .get_index(*i)
                    .map(|(_, r)| r.clone())
                    .into_iter()
                    .collect(),
                Some(ResultKey::Range(range)) => stored
                    .values()
                    .skip(range.start)
                    .take(range.end.saturating_sub(range.start))
                    .cloned()
                    .collect(),
                Some(ResultKey::Id(id)) => match stored.get(id) {
                    Some(result) => vec![result.clone()],
                    None => stored.values().filter(|r| &r.name == id).cloned().collect(),
                },
            };
            (selected, stored.len())
        };
        if selected.is_empty() {
            let key = query.key.as_ref().map(|k| format!("{k:?}")).unwrap_or_default();
            let mut message = format!("analysis result {key} ({stored_len} results stored)");
            let errors = self.errors().await;
            if !errors.is_empty() {
                message.push_str("\nErrors: ");
                message.push_str(&errors);
            }
            return Err(ExpDataError::NotFound(message));
        }
        Ok(selected)
    }
}
