//! Integration tests for saving, loading, copying and serializing experiments.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arvak_expdata::service::{ExperimentRecord, ServiceResult};
use arvak_expdata::{
    AnalysisResult, CallbackKwargs, DataIndex, ExpDataError, ExperimentConfig, ExperimentData,
    ExperimentService, Figure, FigureInput, JsonFileService, MemoryService, ResultQuery,
    ServiceError, ServiceOptions, ServiceRegistry, analysis_fn,
};
use async_trait::async_trait;
use fake_backend::{FakeBackend, as_job};

/// Memory service whose deletions can be made to fail.
struct FlakyService {
    inner: MemoryService,
    fail_deletes: AtomicBool,
    options: ServiceOptions,
}

impl FlakyService {
    fn new(auto_save: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryService::new(),
            fail_deletes: AtomicBool::new(true),
            options: ServiceOptions { auto_save },
        })
    }

    fn check_delete(&self) -> ServiceResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ServiceError::Request("service unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentService for FlakyService {
    fn options(&self) -> ServiceOptions {
        self.options
    }

    async fn create_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        self.inner.create_experiment(record).await
    }

    async fn update_experiment(&self, record: &ExperimentRecord) -> ServiceResult<()> {
        self.inner.update_experiment(record).await
    }

    async fn experiment(&self, experiment_id: &str) -> ServiceResult<ExperimentRecord> {
        self.inner.experiment(experiment_id).await
    }

    async fn create_figure(
        &self,
        experiment_id: &str,
        name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        self.inner.create_figure(experiment_id, name, figure).await
    }

    async fn update_figure(
        &self,
        experiment_id: &str,
        name: &str,
        figure: &[u8],
    ) -> ServiceResult<()> {
        self.inner.update_figure(experiment_id, name, figure).await
    }

    async fn figure(&self, experiment_id: &str, name: &str) -> ServiceResult<Vec<u8>> {
        self.inner.figure(experiment_id, name).await
    }

    async fn delete_figure(&self, experiment_id: &str, name: &str) -> ServiceResult<()> {
        self.check_delete()?;
        self.inner.delete_figure(experiment_id, name).await
    }

    async fn create_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        self.inner.create_analysis_result(result).await
    }

    async fn update_analysis_result(&self, result: &AnalysisResult) -> ServiceResult<()> {
        self.inner.update_analysis_result(result).await
    }

    async fn analysis_results(
        &self,
        experiment_id: &str,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<AnalysisResult>> {
        self.inner.analysis_results(experiment_id, limit).await
    }

    async fn delete_analysis_result(&self, result_id: &str) -> ServiceResult<()> {
        self.check_delete()?;
        self.inner.delete_analysis_result(result_id).await
    }
}

const SVG: &[u8] = b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_writes_metadata_results_and_figures() {
    let backend = FakeBackend::new("fake_armonk");
    let service =
        Arc::new(MemoryService::new().with_web_interface_link("https://experiments.example"));
    let expdata = ExperimentData::builder()
        .experiment_type("Rabi")
        .backend(backend.clone())
        .service(service.clone())
        .tags(["calibration"])
        .build()
        .unwrap();

    expdata.add_figure(SVG.to_vec(), Some("rabi"), false).await.unwrap();
    let result = AnalysisResult::new("rabi_rate", 2.5);
    let result_id = result.result_id.clone();
    expdata.add_analysis_results([result]).await;

    assert!(expdata.save().await);
    assert!(expdata.created_in_db());
    assert_eq!(service.experiment_count().await, 1);
    assert_eq!(service.figure_names(expdata.experiment_id()).await, vec!["rabi.svg".to_string()]);
    assert_eq!(service.result_ids().await, vec![result_id]);

    let record = service.experiment(expdata.experiment_id()).await.unwrap();
    assert_eq!(record.tags, vec!["calibration".to_string()]);
    assert_eq!(record.backend_name.as_deref(), Some("fake_armonk"));
    assert!(record.metadata.contains_key("_source"));

    // A second save updates instead of failing on the existing record.
    expdata.set_notes("second pass").await;
    assert!(expdata.save().await);
    let record = service.experiment(expdata.experiment_id()).await.unwrap();
    assert_eq!(record.notes, "second pass");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_requires_service_and_backend() {
    let expdata = ExperimentData::new("T1").unwrap();
    assert!(!expdata.save().await);

    let service = Arc::new(MemoryService::new());
    expdata.set_service(service.clone()).await.unwrap();
    assert!(!expdata.save_metadata().await);
    assert!(!expdata.save().await);
    assert_eq!(service.experiment_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_can_only_be_set_once() {
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.set_service(Arc::new(MemoryService::new())).await.unwrap();
    let err = expdata
        .set_service(Arc::new(MemoryService::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExpDataError::ServiceAlreadySet));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_save_from_service_options() {
    let backend = FakeBackend::new("fake");
    let service = Arc::new(MemoryService::new().with_options(ServiceOptions { auto_save: true }));
    let expdata = ExperimentData::builder()
        .experiment_type("T1")
        .backend(backend)
        .build()
        .unwrap();
    expdata.add_figure(SVG.to_vec(), Some("early.svg"), false).await.unwrap();

    expdata.set_service(service.clone()).await.unwrap();
    assert!(expdata.auto_save());
    assert!(expdata.created_in_db());
    assert_eq!(service.figure_names(expdata.experiment_id()).await, vec!["early.svg".to_string()]);

    expdata.set_tags(vec!["b".into(), "a".into(), "b".into()]).await;
    let record = service.experiment(expdata.experiment_id()).await.unwrap();
    assert_eq!(record.tags, vec!["a".to_string(), "b".to_string()]);

    expdata
        .add_analysis_results([AnalysisResult::new("t1", 4.2e-5)])
        .await;
    assert_eq!(service.result_ids().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_deletions_stay_queued_until_next_save() {
    let backend = FakeBackend::new("fake");
    let service = FlakyService::new(true);
    let expdata = ExperimentData::builder()
        .experiment_type("T1")
        .backend(backend)
        .build()
        .unwrap();
    expdata.set_service(service.clone()).await.unwrap();

    expdata.add_figures(vec![SVG.to_vec().into()], Some(vec!["f1".into()]), false, None)
        .await
        .unwrap();
    let result = AnalysisResult::new("amp", 0.3);
    let result_id = result.result_id.clone();
    expdata.add_analysis_results([result]).await;

    assert_eq!(expdata.delete_figure("f1.svg").await.unwrap(), "f1.svg");
    assert_eq!(expdata.delete_analysis_result(result_id.as_str()).await.unwrap(), result_id);
    assert_eq!(expdata.pending_figure_deletions(), vec!["f1.svg".to_string()]);
    assert_eq!(expdata.pending_result_deletions(), vec![result_id.clone()]);
    assert!(!expdata.save().await);

    service.fail_deletes.store(false, Ordering::SeqCst);
    assert!(expdata.save().await);
    assert!(expdata.pending_figure_deletions().is_empty());
    assert!(expdata.pending_result_deletions().is_empty());
    assert!(service.inner.figure_names(expdata.experiment_id()).await.is_empty());
    assert!(service.inner.result_ids().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleting_figure_already_gone_remotely_is_not_requeued() {
    let backend = FakeBackend::new("fake");
    let service = Arc::new(MemoryService::new().with_options(ServiceOptions { auto_save: true }));
    let expdata = ExperimentData::builder()
        .experiment_type("T1")
        .backend(backend)
        .build()
        .unwrap();
    expdata.set_service(service.clone()).await.unwrap();
    expdata
        .add_figures(vec![SVG.to_vec().into()], Some(vec!["a.svg".into()]), false, None)
        .await
        .unwrap();
    assert_eq!(service.figure_names(expdata.experiment_id()).await, vec!["a.svg".to_string()]);

    service.delete_figure(expdata.experiment_id(), "a.svg").await.unwrap();
    assert_eq!(expdata.delete_figure("a.svg").await.unwrap(), "a.svg");
    assert!(expdata.pending_figure_deletions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_figures_overwrite_and_naming() {
    let expdata = ExperimentData::builder()
        .experiment_type("Ramsey")
        .experiment_id("0123456789abcdef")
        .build()
        .unwrap();

    let generated = expdata.add_figure(SVG.to_vec(), None, false).await.unwrap();
    assert_eq!(generated, "Ramsey_Fig-0_Exp-01234567.svg");

    expdata.add_figure(b"<svg>1</svg>".to_vec(), Some("fit"), false).await.unwrap();
    let err = expdata
        .add_figure(b"<svg>2</svg>".to_vec(), Some("fit.svg"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ExpDataError::AlreadyExists(_)));

    expdata.add_figure(b"<svg>2</svg>".to_vec(), Some("fit.svg"), true).await.unwrap();
    let stored = expdata.figure("fit.svg").await.unwrap().to_bytes().unwrap();
    assert_eq!(stored.as_ref(), b"<svg>2</svg>");
    assert_eq!(expdata.figure(1usize).await.unwrap().to_bytes().unwrap().as_ref(), b"<svg>2</svg>");
    assert_eq!(expdata.figure_names().len(), 2);

    let mismatched = expdata
        .add_figures(vec![FigureInput::Bytes(SVG.to_vec())], Some(vec![]), false, None)
        .await;
    assert!(matches!(mismatched, Err(ExpDataError::InvalidArgument(_))));
    assert!(matches!(expdata.figure("missing.svg").await, Err(ExpDataError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_figure_from_file_uses_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t1_decay.svg");
    std::fs::write(&path, SVG).unwrap();

    let expdata = ExperimentData::new("T1").unwrap();
    let name = expdata.add_figure(path, None, false).await.unwrap();
    assert_eq!(name, "t1_decay.svg");

    let out = dir.path().join("copy.svg");
    assert_eq!(expdata.write_figure(name.as_str(), &out).await.unwrap(), SVG.len());
    assert_eq!(std::fs::read(out).unwrap(), SVG);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_restores_experiment() {
    let backend = FakeBackend::new("fake");
    let job = backend.finished_job("J1", &[("0", 7), ("1", 3)]);
    let service = Arc::new(MemoryService::new());

    let original = ExperimentData::builder()
        .experiment_type("Rabi")
        .backend(backend.clone())
        .service(service.clone())
        .notes("drive amplitude sweep")
        .share_level("project")
        .build()
        .unwrap();
    original.add_jobs([as_job(&job)], None).await;
    original.add_figure(SVG.to_vec(), Some("rabi"), false).await.unwrap();
    original
        .add_analysis_results([AnalysisResult::new("rabi_rate", 1.1)])
        .await;
    original.block_for_results(None).await;
    assert!(original.save().await);

    let loaded =
        ExperimentData::load(original.experiment_id(), service.clone(), Some(backend.clone()))
            .await
            .unwrap();
    assert!(loaded.created_in_db());
    assert_eq!(loaded.experiment_type(), "Rabi");
    assert_eq!(loaded.notes(), "drive amplitude sweep");
    assert_eq!(loaded.share_level().as_deref(), Some("project"));
    assert_eq!(loaded.job_ids(), original.job_ids());
    assert_eq!(loaded.figure_names(), vec!["rabi.svg".to_string()]);
    assert_eq!(loaded.source(), original.source());

    let records = loaded.data(DataIndex::All).await.unwrap();
    assert_eq!(records.len(), 1);
    let results = loaded
        .analysis_results(ResultQuery::all().block(false))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "rabi_rate");
    let figure = loaded.figure("rabi.svg").await.unwrap();
    assert_eq!(figure.to_bytes().unwrap().as_ref(), SVG);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_json_file_service_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new("fake");
    let service: Arc<dyn ExperimentService> =
        Arc::new(JsonFileService::new(dir.path()).await.unwrap());

    let expdata = ExperimentData::builder()
        .experiment_type("T2")
        .backend(backend.clone())
        .service(service.clone())
        .build()
        .unwrap();
    expdata.add_figure(SVG.to_vec(), Some("echo"), false).await.unwrap();
    expdata
        .add_analysis_results([AnalysisResult::new("t2", 6.0e-5).with_quality("good")])
        .await;
    assert!(expdata.save().await);

    let loaded = ExperimentData::load(expdata.experiment_id(), service, None).await.unwrap();
    assert_eq!(loaded.figure_names(), vec!["echo.svg".to_string()]);
    let results = loaded.analysis_results(ResultQuery::key("t2")).await.unwrap();
    assert_eq!(results[0].quality.as_deref(), Some("good"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provider_service_is_adopted_from_registry() {
    let backend = FakeBackend::with_provider("fake", "arvak-cloud");
    let service = Arc::new(MemoryService::new().with_options(ServiceOptions { auto_save: true }));
    let mut registry = ServiceRegistry::new();
    registry.register("arvak-cloud", service.clone());
    let registry = Arc::new(registry);

    // At construction the configured flag wins.
    let built = ExperimentData::builder()
        .experiment_type("T1")
        .registry(registry.clone())
        .backend(backend.clone())
        .build()
        .unwrap();
    assert!(built.service().is_some());
    assert!(!built.auto_save());

    // A job's backend brings the provider's service and preference.
    let expdata = ExperimentData::builder()
        .experiment_type("T1")
        .registry(registry)
        .build()
        .unwrap();
    expdata
        .add_jobs([as_job(&backend.finished_job("J1", &[("0", 1)]))], None)
        .await;
    assert!(expdata.service().is_some());
    assert!(expdata.auto_save());
    assert_eq!(expdata.provider().as_deref(), Some("arvak-cloud"));
    assert!(service.experiment(expdata.experiment_id()).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_copy_with_results() {
    let backend = FakeBackend::new("fake");
    let service = Arc::new(MemoryService::new());
    service.create_experiment(&ExperimentRecord {
        experiment_id: "remote".into(),
        experiment_type: "Rabi".into(),
        ..ExperimentRecord::default()
    })
    .await
    .unwrap();
    service.create_figure("remote", "stored.svg", SVG).await.unwrap();

    let original = ExperimentData::builder()
        .experiment_type("Rabi")
        .experiment_id("remote")
        .backend(backend.clone())
        .service(service.clone())
        .figure_names(["stored.svg"])
        .tags(["x"])
        .build()
        .unwrap();
    let pending = backend.job("J1");
    original.add_jobs([as_job(&pending)], None).await;
    original.add_figure(Figure::image(SVG.to_vec()), Some("local"), false).await.unwrap();
    original.add_analysis_callback(
        analysis_fn("fit", |data, _kwargs| async move {
            data.add_analysis_results([AnalysisResult::new("amp", 0.7)]).await;
            Ok(())
        }),
        CallbackKwargs::new(),
    );
    pending.finish(&[("0", 1)]);

    let copy = original.copy(true).await.unwrap();
    assert_ne!(copy.experiment_id(), original.experiment_id());
    assert_eq!(copy.tags(), original.tags());
    assert_eq!(copy.job_ids(), original.job_ids());
    assert_eq!(copy.figure_names(), vec!["stored.svg".to_string(), "local.svg".to_string()]);

    copy.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(copy.data_len(), 1);

    let copied = copy.analysis_results(ResultQuery::all()).await.unwrap();
    let originals = original.analysis_results(ResultQuery::all()).await.unwrap();
    assert_eq!(copied.len(), 1);
    assert_eq!(copied[0].name, originals[0].name);
    assert_ne!(copied[0].result_id, originals[0].result_id);
    assert_eq!(copied[0].experiment_id, copy.experiment_id());
    assert!(copy.analysis_callbacks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_requires_finished_tasks() {
    let backend = FakeBackend::new("fake");
    let job = backend.job("J1");
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_jobs([as_job(&job)], None).await;

    assert!(matches!(expdata.to_snapshot(), Err(ExpDataError::Outstanding(_))));

    job.finish(&[("0", 1)]);
    expdata.block_for_results(None).await;
    let snapshot = expdata.to_snapshot().unwrap();
    assert_eq!(snapshot.job_ids, vec!["J1".to_string()]);
    assert_eq!(snapshot.data.len(), 1);

    let restored = ExperimentData::from_snapshot(snapshot).unwrap();
    assert!(restored.jobs().is_empty());
    assert_eq!(restored.data_len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_controls_new_experiments() {
    let config = ExperimentConfig {
        analysis_workers: 1,
        cancel_wait_ms: 10,
        auto_save: true,
        ..ExperimentConfig::default()
    };
    let expdata = ExperimentData::builder()
        .experiment_type("T1")
        .config(config)
        .build()
        .unwrap();
    assert!(expdata.auto_save());
    assert_eq!(expdata.executors().free_analysis_slots(), 1);

    let invalid = ExperimentConfig {
        analysis_workers: 0,
        ..ExperimentConfig::default()
    };
    assert!(matches!(
        ExperimentData::builder().config(invalid).build(),
        Err(ExpDataError::Config(_))
    ));
}
