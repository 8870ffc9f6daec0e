//! JSON file-based experiment service for development and testing.
//!
//! Layout under the base directory:
//!
//! ```text
//! experiments/<experiment_id>.json
//! figures/<experiment_id>/<figure_name>
//! results/<result_id>.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::{ExperimentRecord, ExperimentService, ServiceError, ServiceOptions, ServiceResult};
use crate::analysis_result::AnalysisResult;

/// JSON file-based experiment service.
///
/// Stores every entity as a separate file. Suitable for development and
/// single-user setups.
pub struct JsonFileService {
    base_dir: PathBuf,
    options: ServiceOptions,
    /// Serializes writers so existence checks and writes are atomic.
    write_lock: Mutex<()>,
}

impl JsonFileService {
    /// Open (and create if needed) a store at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> ServiceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(base_dir.join("experiments")).await?;
        fs::create_dir_all(base_dir.join("figures")).await?;
        fs::create_dir_all(base_dir.join("results")).await?;

        Ok(Self {
            base_dir,
            options: ServiceOptions::default(),
            write_lock: Mutex::new(()),
        })
    }

    /// Default store location: `$ARVAK_EXPDATA_DIR` or the user data
    /// directory.
    pub fn default_location() -> PathBuf {
        std::env::var("ARVAK_EXPDATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("arvak")
                    .join("experiments")
            })
    }

    /// Set the options advertised to bound experiments.
    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Base directory of the store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn experiment_path(&self, experiment_id: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join("experiments")
            .join(format!("{}.json", safe_component(experiment_id)?)))
    }

    fn figure_dir(&self, experiment_id: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join("figures")
            .join(safe_component(experiment_id)?))
    }

    fn figure_path(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .figure_dir(experiment_id)?
            .join(safe_component(figure_name)?))
    }

    fn result_path(&self, result_id: &str) -> ServiceResult<PathBuf> {
        Ok(self
            .base_dir
            .join("results")
            .join(format!("{}.json", safe_component(result_id)?)))
    }
}

/// Reject names that would escape their directory.
fn safe_component(name: &str) -> ServiceResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ServiceError::Request(format!("invalid entry name '{name}'")));
    }
    Ok(name)
}

async fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> ServiceResult<T> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::NotFound(what.to_string())),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> ServiceResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).await?;
    Ok(())
}

async fn remove(path: &Path, what: &str) -> ServiceResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::NotFound(what.to_string())),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ExperimentService for JsonFileService {
    fn options(&self) -> ServiceOptions {
        self.options
    }

    async fn create_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.experiment_path(&record.experiment_id)?;
        if fs::try_exists(&path).await? {
            return Err(ServiceError::AlreadyExists(record.experiment_id.clone()));
        }
        write_json(&path, record).await
    }

    async fn update_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.experiment_path(&record.experiment_id)?;
        let mut stored: ExperimentRecord = read_json(&path, &record.experiment_id).await?;
        stored.apply_update(record);
        write_json(&path, &stored).await
    }

    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord> {
        let mut record: ExperimentRecord =
            read_json(&self.experiment_path(experiment_id)?, experiment_id).await?;

        record.figure_names.clear();
        let dir = self.figure_dir(experiment_id)?;
        if fs::try_exists(&dir).await? {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                record
                    .figure_names
                    .push(entry.file_name().to_string_lossy().into_owned());
            }
            record.figure_names.sort();
        }
        Ok(record)
    }

    async fn create_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.figure_path(experiment_id, figure_name)?;
        if fs::try_exists(&path).await? {
            return Err(ServiceError::AlreadyExists(figure_name.to_string()));
        }
        fs::create_dir_all(self.figure_dir(experiment_id)?).await?;
        fs::write(&path, figure).await?;
        Ok(())
    }

    async fn update_figure(
        &self,
        experiment_id: &str,
        figure_name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.figure_path(experiment_id, figure_name)?;
        if !fs::try_exists(&path).await? {
            return Err(ServiceError::NotFound(figure_name.to_string()));
        }
        fs::write(&path, figure).await?;
        Ok(())
    }

    async fn figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<Vec<u8>> {
        match fs::read(self.figure_path(experiment_id, figure_name)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ServiceError::NotFound(figure_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_figure(&self, experiment_id: &str, figure_name: &str) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        remove(&self.figure_path(experiment_id, figure_name)?, figure_name).await
    }

    async fn create_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.result_path(&result.result_id)?;
        if fs::try_exists(&path).await? {
            return Err(ServiceError::AlreadyExists(result.result_id.clone()));
        }
        write_json(&path, result).await
    }

    async fn update_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.result_path(&result.result_id)?;
        if !fs::try_exists(&path).await? {
            return Err(ServiceError::NotFound(result.result_id.clone()));
        }
        write_json(&path, result).await
    }

    async fn analysis_results(
        &self,
        experiment_id: &str,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<AnalysisResult>> {
        let mut results = Vec::new();
        let mut entries = fs::read_dir(self.base_dir.join("results")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_json::<AnalysisResult>(&path, "analysis result").await {
                Ok(result) if result.experiment_id == experiment_id => results.push(result),
                Ok(_) => {}
                Err(e) => warn!("Failed to read analysis result file {:?}: {}", path, e),
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        results.truncate(limit.unwrap_or(usize::MAX));
        Ok(results)
    }

    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()> {
        let _guard = self.write_lock.lock().await;
        remove(&self.result_path(result_id)?, result_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_experiment_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let service = JsonFileService::new(dir.path()).await.unwrap();

        let record = ExperimentRecord {
            experiment_id: "e1".into(),
            experiment_type: "T1".into(),
            tags: vec!["calibration".into()],
            ..Default::default()
        };
        service.create_experiment(&record).await.unwrap();
        service.create_figure("e1", "decay.svg", b"<svg/>").await.unwrap();

        // A fresh handle on the same directory sees the data.
        let reopened = JsonFileService::new(dir.path()).await.unwrap();
        let loaded = reopened.experiment("e1").await.unwrap();
        assert_eq!(loaded.tags, vec!["calibration".to_string()]);
        assert_eq!(loaded.figure_names, vec!["decay.svg".to_string()]);
        assert!(matches!(
            reopened.create_experiment(&record).await,
            Err(ServiceError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_results_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let service = JsonFileService::new(dir.path()).await.unwrap();

        let mut result = AnalysisResult::new("t1", json!(3.5e-5));
        result.experiment_id = "e1".into();
        service.create_analysis_result(&result).await.unwrap();

        let listed = service.analysis_results("e1", None).await.unwrap();
        assert_eq!(listed, vec![result.clone()]);

        service.delete_analysis_result(&result.result_id).await.unwrap();
        assert!(service.analysis_results("e1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let service = JsonFileService::new(dir.path()).await.unwrap();
        assert!(matches!(
            service.figure("e1", "../secret").await,
            Err(ServiceError::Request(_))
        ));
    }
}
