//! Graceful shutdown of pools and runner nodes.


use std::sync::Arc;
use std::time::Duration;

use jobmesh::config::{PoolConfig, RetryConfig};
use jobmesh::error::PoolError;
use jobmesh::scheduler::{ExitStatus, JobStatus, RunnerStatus};
use jobmesh::store::{JobStore, MemoryJobStore};
use jobmesh::worker::{ProcessorFactory, ReservationClient, ShutdownReport, WorkerPool};
use test_harness::{assert_eventually, new_job, test_runner_config, ExecutionLog, Gate, TestMesh};

async fn started_pool(store: Arc<MemoryJobStore>, factory: Arc<dyn ProcessorFactory>) -> WorkerPool {
    let config = PoolConfig {
        worker_wait_timeout: Duration::from_millis(20),
        ..PoolConfig::with_capacity(2)
    };
    let client = ReservationClient::new(store, RetryConfig::new(3, Duration::from_millis(5)));
    let pool = WorkerPool::start(config, client, factory).unwrap();
    assert_eventually(
        || async { pool.monitor().idle_slots().len() == 2 },
        Duration::from_secs(5),
        "slots should report idle",
    )
    .await;
    pool
}

#[tokio::test]
async fn test_stubborn_job_is_aborted_after_grace() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pool = started_pool(store.clone(), gate.stubborn_factory()).await;

    let job = store.create(new_job("stubborn")).await.unwrap();
    pool.submit(job.clone()).await.unwrap();
    assert_eventually(
        || async { gate.started() == 1 },
        Duration::from_secs(5),
        "processor should start",
    )
    .await;

    let report = pool.shutdown(Duration::from_millis(100)).await;
    assert_eq!(report.aborted_jobs, vec![job.id]);
    assert_eq!(report.completed_slots, 1);
    assert!(pool.is_terminated());

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::done(ExitStatus::Aborted));
    assert!(stored.result.unwrap()["error"].is_string());
}

#[tokio::test]
async fn test_cooperative_job_aborts_within_grace() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pool = started_pool(store.clone(), gate.factory()).await;

    let job = store.create(new_job("polite")).await.unwrap();
    pool.submit(job.clone()).await.unwrap();
    assert_eventually(
        || async { gate.started() == 1 },
        Duration::from_secs(5),
        "processor should start",
    )
    .await;

    let report = pool.shutdown(Duration::from_secs(2)).await;
    // The processor saw the cancellation and wrote its own result.
    assert!(report.aborted_jobs.is_empty());
    assert_eq!(report.completed_slots, 2);
    assert_eq!(
        store.get(job.id).await.unwrap().status,
        JobStatus::done(ExitStatus::Aborted)
    );
}

#[tokio::test]
async fn test_idle_pool_shuts_down_cleanly() {
    let store = Arc::new(MemoryJobStore::new());
    let log = ExecutionLog::new();
    let pool = started_pool(store.clone(), log.factory(Duration::ZERO)).await;

    let report = pool.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.completed_slots, 2);
    assert!(report.aborted_jobs.is_empty());

    // A second shutdown is a no-op.
    assert_eq!(pool.shutdown(Duration::from_secs(1)).await, ShutdownReport::default());
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let store = Arc::new(MemoryJobStore::new());
    let log = ExecutionLog::new();
    let pool = started_pool(store.clone(), log.factory(Duration::ZERO)).await;
    pool.shutdown(Duration::from_secs(1)).await;

    let job = store.create(new_job("late")).await.unwrap();
    let err = pool.submit(job.clone()).await.unwrap_err();
    assert_eq!(err, PoolError::ShuttingDown);
    assert!(store.get(job.id).await.unwrap().is_pending());
    assert_eq!(log.distinct_jobs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runner_node_reports_disconnected() {
    let mut mesh = TestMesh::new().await;
    let gate = Gate::new();
    let config = test_runner_config("local://leaving", 1).with_shutdown_grace(Duration::from_millis(200));
    let node = mesh.start_runner(config, gate.stubborn_factory()).await;
    mesh.wait_until_idle(node.id()).await;

    let job = mesh.submit("in-flight").await;
    assert_eventually(
        || async { gate.started() == 1 },
        Duration::from_secs(5),
        "job should be running",
    )
    .await;

    let report = node.shutdown().await;
    assert_eq!(report.aborted_jobs, vec![job.id]);
    assert_eq!(mesh.runner_status(node.id()).await, RunnerStatus::Disconnected);
    assert_eq!(
        mesh.job(job.id).await.status,
        JobStatus::done(ExitStatus::Aborted)
    );

    // New work is no longer offered to the disconnected runner.
    let next = mesh.submit("after").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(mesh.job(next.id).await.is_pending());
    assert!(mesh.callbacks.offers_of(next.id).is_empty());
}
