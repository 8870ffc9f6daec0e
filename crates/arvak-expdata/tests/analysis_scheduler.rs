//! Integration tests for analysis callback scheduling and cancellation.


use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arvak_expdata::{
    AnalysisResult, AnalysisStatus, CallbackKwargs, ExpDataError, ExperimentData,
    ExperimentStatus, ResultQuery, analysis_fn, current_callback_id,
};
use fake_backend::{FakeBackend, as_job};
use serde_json::json;
use tokio::sync::Notify;

fn status_of(expdata: &ExperimentData, callback_id: &str) -> AnalysisStatus {
    expdata
        .analysis_callbacks()
        .into_iter()
        .find(|cb| cb.callback_id == callback_id)
        .map(|cb| cb.status)
        .unwrap()
}

/// A callback that signals `started` and then waits for `release`.
fn gated(
    name: &str,
    started: Arc<Notify>,
    release: Arc<Notify>,
) -> Arc<dyn arvak_expdata::AnalysisFn> {
    analysis_fn(name, move |_data, _kwargs| {
        let started = started.clone();
        let release = release.clone();
        async move {
            started.notify_one();
            release.notified().await;
            Ok(())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callbacks_run_in_registration_order() {
    let expdata = ExperimentData::new("T1").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (i, delay) in [(1, 60), (2, 0), (3, 20)] {
        let order = order.clone();
        let cb = analysis_fn(format!("cb{i}"), move |_data, _kwargs| {
            let order = order.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().unwrap().push(i);
                Ok(())
            }
        });
        expdata.add_analysis_callback(cb, CallbackKwargs::new());
    }

    expdata.block_for_results(None).await;
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(expdata.analysis_status(), AnalysisStatus::Done);
    assert!(expdata.pending_analysis_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_waits_for_jobs_and_receives_kwargs() {
    let backend = FakeBackend::new("fake");
    let job = backend.job("J1");
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_jobs([as_job(&job)], None).await;

    let seen = Arc::new(Mutex::new(None));
    let cb = {
        let seen = seen.clone();
        analysis_fn("count", move |data, kwargs| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some((data.data_len(), kwargs["scale"].clone()));
                Ok(())
            }
        })
    };
    let mut kwargs = CallbackKwargs::new();
    kwargs.insert("scale".into(), json!(2));
    expdata.add_analysis_callback(cb, kwargs);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().unwrap().is_none());
    assert_eq!(expdata.status().await, ExperimentStatus::Queued);

    job.finish(&[("0", 8)]);
    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(*seen.lock().unwrap(), Some((1, json!(2))));
    assert_eq!(expdata.status().await, ExperimentStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_callback_while_predecessor_runs() {
    let expdata = ExperimentData::new("T1").unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let c1 = expdata.add_analysis_callback(
        gated("c1", started.clone(), release.clone()),
        CallbackKwargs::new(),
    );

    let ran = Arc::new(Mutex::new(false));
    let c2 = {
        let ran = ran.clone();
        expdata.add_analysis_callback(
            analysis_fn("c2", move |_data, _kwargs| {
                let ran = ran.clone();
                async move {
                    *ran.lock().unwrap() = true;
                    Ok(())
                }
            }),
            CallbackKwargs::new(),
        )
    };

    started.notified().await;
    assert_eq!(status_of(&expdata, &c1), AnalysisStatus::Running);
    assert!(expdata.cancel_analysis(Some(&[c2.clone()])).await);
    assert_eq!(status_of(&expdata, &c2), AnalysisStatus::Cancelled);

    release.notify_one();
    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(status_of(&expdata, &c1), AnalysisStatus::Done);
    assert_eq!(status_of(&expdata, &c2), AnalysisStatus::Cancelled);
    assert!(!*ran.lock().unwrap());
    assert_eq!(expdata.status().await, ExperimentStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_callback_cannot_be_cancelled() {
    let expdata = ExperimentData::new("T1").unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let c1 = expdata.add_analysis_callback(
        gated("c1", started.clone(), release.clone()),
        CallbackKwargs::new(),
    );

    started.notified().await;
    assert!(!expdata.cancel_analysis(None).await);
    assert!(status_of(&expdata, &c1) == AnalysisStatus::Running);

    release.notify_one();
    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(status_of(&expdata, &c1), AnalysisStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_callback_is_recorded_and_does_not_block_successors() {
    let expdata = ExperimentData::new("T1").unwrap();
    let failing = expdata.add_analysis_callback(
        analysis_fn("fit", |_data, _kwargs| async {
            Err::<(), _>(anyhow::anyhow!("fit did not converge"))
        }),
        CallbackKwargs::new(),
    );
    let after = expdata.add_analysis_callback(
        analysis_fn("plot", |_data, _kwargs| async { Ok(()) }),
        CallbackKwargs::new(),
    );

    expdata.block_for_results(None).await;
    assert_eq!(status_of(&expdata, &failing), AnalysisStatus::Error);
    assert_eq!(status_of(&expdata, &after), AnalysisStatus::Done);

    let errors = expdata.analysis_errors();
    assert!(errors.contains(&format!("[Analysis Callback ID: {failing}]")), "{errors}");
    assert!(errors.contains("fit did not converge"), "{errors}");
    assert_eq!(expdata.status().await, ExperimentStatus::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_callback_is_caught() {
    let expdata = ExperimentData::new("T1").unwrap();
    let cb = expdata.add_analysis_callback(
        analysis_fn("boom", |data, _kwargs| async move {
            if data.data_len() == 0 {
                panic!("no data to analyse");
            }
            Ok(())
        }),
        CallbackKwargs::new(),
    );

    expdata.block_for_results(None).await;
    assert_eq!(status_of(&expdata, &cb), AnalysisStatus::Error);
    assert!(expdata.analysis_errors().contains("no data to analyse"));
    assert_eq!(expdata.executors().free_analysis_slots(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unexpected_job_failure_cancels_callback() {
    let backend = FakeBackend::new("fake");
    let job = backend.job("J1");
    job.break_result("socket closed");

    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_jobs([as_job(&job)], None).await;
    let cb = expdata.add_analysis_callback(
        analysis_fn("fit", |_data, _kwargs| async { Ok(()) }),
        CallbackKwargs::new(),
    );

    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(status_of(&expdata, &cb), AnalysisStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_block_for_results_honours_timeout() {
    let expdata = ExperimentData::new("T1").unwrap();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    expdata.add_analysis_callback(
        gated("stuck", started.clone(), release.clone()),
        CallbackKwargs::new(),
    );
    started.notified().await;

    let begin = Instant::now();
    expdata.block_for_results(Some(Duration::from_millis(20))).await;
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert_eq!(expdata.status().await, ExperimentStatus::PostProcessing);
    assert_eq!(expdata.pending_analysis_ids().len(), 1);

    release.notify_one();
    expdata.block_for_results(None).await;
    assert!(expdata.pending_analysis_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_calls_inside_callback() {
    let expdata = ExperimentData::new("T1").unwrap();
    let observed = Arc::new(Mutex::new(None));
    let cb = {
        let observed = observed.clone();
        analysis_fn("nested", move |data, _kwargs| {
            let observed = observed.clone();
            async move {
                data.block_for_results(None).await;
                data.add_analysis_results([AnalysisResult::new("t1", 42.0)]).await;
                let results = data.analysis_results(ResultQuery::all()).await?;
                let copy = data.copy(true).await;
                *observed.lock().unwrap() = Some((
                    current_callback_id(),
                    results.len(),
                    matches!(copy, Err(ExpDataError::InsideCallback(_))),
                ));
                Ok(())
            }
        })
    };
    let cb_id = expdata.add_analysis_callback(cb, CallbackKwargs::new());

    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert_eq!(status_of(&expdata, &cb_id), AnalysisStatus::Done);
    assert_eq!(*observed.lock().unwrap(), Some((Some(cb_id), 1, true)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_block_for_results_waits_for_work_spawned_by_callbacks() {
    let backend = FakeBackend::new("fake");
    let expdata = ExperimentData::new("T1").unwrap();

    let follow_up_ran = Arc::new(Mutex::new(false));
    let spawner = {
        let backend = backend.clone();
        let follow_up_ran = follow_up_ran.clone();
        analysis_fn("spawner", move |data, _kwargs| {
            let job = backend.finished_job("late", &[("1", 2)]);
            let follow_up_ran = follow_up_ran.clone();
            async move {
                data.add_jobs([as_job(&job)], None).await;
                data.add_analysis_callback(
                    analysis_fn("follow_up", move |_data, _kwargs| {
                        let follow_up_ran = follow_up_ran.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            *follow_up_ran.lock().unwrap() = true;
                            Ok(())
                        }
                    }),
                    CallbackKwargs::new(),
                );
                Ok(())
            }
        })
    };
    expdata.add_analysis_callback(spawner, CallbackKwargs::new());

    expdata.block_for_results(Some(Duration::from_secs(5))).await;
    assert!(*follow_up_ran.lock().unwrap());
    assert_eq!(expdata.data_len(), 1);
    assert_eq!(expdata.analysis_callbacks().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_analysis_results_blocks_for_pending_analysis() {
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_analysis_callback(
        analysis_fn("fit", |data, _kwargs| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            data.add_analysis_results([
                AnalysisResult::new("amp", 0.9),
                AnalysisResult::new("freq", 5.1e9),
            ])
            .await;
            Ok(())
        }),
        CallbackKwargs::new(),
    );

    let results = expdata.analysis_results(ResultQuery::all()).await.unwrap();
    assert_eq!(results.len(), 2);
    let freq = expdata.analysis_results(ResultQuery::key("freq")).await.unwrap();
    assert_eq!(freq[0].value, json!(5.1e9));
    assert!(matches!(
        expdata.analysis_results(ResultQuery::key(5usize)).await,
        Err(ExpDataError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_result_reports_analysis_errors() {
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_analysis_callback(
        analysis_fn("fit", |_data, _kwargs| async {
            Err::<(), _>(anyhow::anyhow!("fit diverged"))
        }),
        CallbackKwargs::new(),
    );

    match expdata.analysis_results(ResultQuery::key("missing")).await {
        Err(ExpDataError::NotFound(message)) => {
            assert!(message.contains("missing"), "{message}");
            assert!(message.contains("fit diverged"), "{message}");
        }
        other => panic!("unexpected lookup result {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_queued_work() {
    let backend = FakeBackend::new("fake");
    let job = backend.job("J1");
    let expdata = ExperimentData::new("T1").unwrap();
    expdata.add_jobs([as_job(&job)], None).await;
    let cb = expdata.add_analysis_callback(
        analysis_fn("fit", |_data, _kwargs| async { Ok(()) }),
        CallbackKwargs::new(),
    );

    assert!(expdata.cancel().await);
    assert_eq!(status_of(&expdata, &cb), AnalysisStatus::Cancelled);
    assert!(expdata.pending_analysis_ids().is_empty());
    assert_eq!(expdata.status().await, ExperimentStatus::Cancelled);
}
