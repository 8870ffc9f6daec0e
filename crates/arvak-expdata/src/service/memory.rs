//! In-memory experiment service (no persistence).
//!
//! This implementation uses `Arc<RwLock<FxHashMap>>` for thread-safe
//! in-memory storage. Everything is lost when the process exits.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use super::{ExperimentRecord, ExperimentService, ServiceError, ServiceOptions, ServiceResult};
use crate::analysis_result::AnalysisResult;

#[derive(Default)]
struct Store {
    experiments: FxHashMap<String, ExperimentRecord>,
    /// Figures per experiment, in upload order.
    figures: FxHashMap<String, Vec<(String, Vec<u8>)>>,
    /// Analysis results in creation order.
    results: Vec<AnalysisResult>,
}

/// In-memory experiment service.
#[derive(Clone, Default)]
pub struct MemoryService {
    store: Arc<RwLock<Store>>,
    options: ServiceOptions,
    web_link: Option<String>,
}

impl MemoryService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the options advertised to bound experiments.
    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the web interface base URL.
    pub fn with_web_interface_link(mut self, link: impl Into<String>) -> Self {
        self.web_link = Some(link.into());
        self
    }

    /// Number of stored experiments.
    pub async fn experiment_count(&self) -> usize {
        self.store.read().await.experiments.len()
    }

    /// Names of the figures stored for an experiment.
    pub async fn figure_names(&self, experiment_id: &str) -> Vec<String> {
        let store = self.store.read().await;
        store
            .figures
            .get(experiment_id)
            .map(|figs| figs.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Ids of all stored analysis results.
    pub async fn result_ids(&self) -> Vec<String> {
        let store = self.store.read().await;
        store.results.iter().map(|r| r.result_id.clone()).collect()
    }
}

#[async_trait]
impl ExperimentService for MemoryService {
    fn options(&self) -> ServiceOptions {
        self.options
    }

    fn web_interface_link(&self) -> Option<String> {
        self.web_link.clone()
    }

    async fn create_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        if store.experiments.contains_key(&record.experiment_id) {
            return Err(ServiceError::AlreadyExists(record.experiment_id.clone()));
        }
        store
            .experiments
            .insert(record.experiment_id.clone(), record.clone());
        Ok(())
    }

    async fn update_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let stored = store
            .experiments
            .get_mut(&record.experiment_id)
            .ok_or_else(|| ServiceError::NotFound(record.experiment_id.clone()))?;
        stored.apply_update(record);
        Ok(())
    }

    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord> {
        let store = self.store.read().await;
        let mut record = store
            .experiments
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(experiment_id.to_string()))?;
        record.figure_names = store
            .figures
            .get(experiment_id)
            .map(|figs| figs.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();
        Ok(record)
    }

    async fn create_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let figs = store.figures.entry(experiment_id.to_string()).or_default();
        if figs.iter().any(|(name, _)| name == figure_name) {
            return Err(ServiceError::AlreadyExists(figure_name.to_string()));
        }
        figs.push((figure_name.to_string(), figure.to_vec()));
        Ok(())
    }

    async fn update_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let slot = store
            .figures
            .get_mut(experiment_id)
            .and_then(|figs| figs.iter_mut().find(|(name, _)| name == figure_name))
            .ok_or_else(|| ServiceError::NotFound(figure_name.to_string()))?;
        slot.1 = figure.to_vec();
        Ok(())
    }

    async fn figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<Vec<u8>> {
        let store = self.store.read().await;
        store
            .figures
            .get(experiment_id)
            .and_then(|figs| figs.iter().find(|(name, _)| name == figure_name))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ServiceError::NotFound(figure_name.to_string()))
    }

    async fn delete_figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let figs = store
            .figures
            .get_mut(experiment_id)
            .ok_or_else(|| ServiceError::NotFound(figure_name.to_string()))?;
        let before = figs.len();
        figs.retain(|(name, _)| name != figure_name);
        if figs.len() == before {
            return Err(ServiceError::NotFound(figure_name.to_string()));
        }
        Ok(())
    }

    async fn create_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        if store.results.iter().any(|r| r.result_id == result.result_id) {
            return Err(ServiceError::AlreadyExists(result.result_id.clone()));
        }
        store.results.push(result.clone());
        Ok(())
    }

    async fn update_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let stored = store
            .results
            .iter_mut()
            .find(|r| r.result_id == result.result_id)
            .ok_or_else(|| ServiceError::NotFound(result.result_id.clone()))?;
        *stored = result.clone();
        Ok(())
    }

    async fn analysis_results(
        &self,
        experiment_id: &str,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<AnalysisResult>> {
        let store = self.store.read().await;
        Ok(store
            .results
            .iter()
            .filter(|r| r.experiment_id == experiment_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()> {
        let mut store = self.store.write().await;
        let before = store.results.len();
        store.results.retain(|r| r.result_id != result_id);
        if store.results.len() == before {
            return Err(ServiceError::NotFound(result_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_figure_lifecycle() {
        let service = MemoryService::new();
        service.create_figure("e1", "a.svg", b"1").await.unwrap();
        assert!(matches!(
            service.create_figure("e1", "a.svg", b"2").await,
            Err(ServiceError::AlreadyExists(_))
        ));
        service.update_figure("e1", "a.svg", b"2").await.unwrap();
        assert_eq!(service.figure("e1", "a.svg").await.unwrap(), b"2");

        service.delete_figure("e1", "a.svg").await.unwrap();
        assert!(matches!(
            service.delete_figure("e1", "a.svg").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_analysis_results_filtered_and_limited() {
        let service = MemoryService::new();
        for i in 0..3 {
            let mut result = AnalysisResult::new(format!("r{i}"), json!(i));
            result.experiment_id = "e1".into();
            service.create_analysis_result(&result).await.unwrap();
        }
        let mut other = AnalysisResult::new("x", json!(0));
        other.experiment_id = "e2".into();
        service.create_analysis_result(&other).await.unwrap();

        assert_eq!(service.analysis_results("e1", None).await.unwrap().len(), 3);
        let limited = service.analysis_results("e1", Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].name, "r0");
    }
}
