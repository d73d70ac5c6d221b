//! Worker pool tests: capacity, reservation races and processor outcomes.


use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobmesh::config::{PoolConfig, RetryConfig};
use jobmesh::error::{PoolError, ProcessorError};
use jobmesh::scheduler::{ExitStatus, Job, JobStatus, RunStatus};
use jobmesh::store::{JobStore, MemoryJobStore, SharedJobStore};
use jobmesh::worker::{
    FnProcessorFactory, PoolStatus, ProcessorFactory, ReservationClient, ShellProcessorFactory,
    WorkerPool,
};
use test_harness::{assert_eventually, new_job, Gate};
use tokio_util::sync::CancellationToken;

fn start_pool(store: SharedJobStore, capacity: usize, factory: Arc<dyn ProcessorFactory>) -> WorkerPool {
    let config = PoolConfig {
        worker_wait_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(2),
        ..PoolConfig::with_capacity(capacity)
    };
    let client = ReservationClient::new(store, RetryConfig::new(3, Duration::from_millis(5)));
    WorkerPool::start(config, client, factory).unwrap()
}

async fn wait_all_idle(pool: &WorkerPool) {
    assert_eventually(
        || async { pool.monitor().idle_slots().len() == pool.capacity() },
        Duration::from_secs(5),
        "all slots should report idle",
    )
    .await;
}

async fn wait_for_status(store: &MemoryJobStore, job: &Job, expected: JobStatus) -> Job {
    assert_eventually(
        || async { store.get(job.id).await.unwrap().status == expected },
        Duration::from_secs(5),
        "job should reach the expected status",
    )
    .await;
    store.get(job.id).await.unwrap()
}

#[tokio::test]
async fn test_zero_capacity_is_rejected() {
    let store = Arc::new(MemoryJobStore::new());
    let client = ReservationClient::new(store, RetryConfig::default());
    let result = WorkerPool::start(PoolConfig::with_capacity(0), client, Gate::new().factory());
    assert!(result.is_err());
}

#[tokio::test]
async fn test_full_pool_declines_without_queueing() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pool = start_pool(store.clone(), 2, gate.factory());
    wait_all_idle(&pool).await;

    let a = store.create(new_job("a")).await.unwrap();
    let b = store.create(new_job("b")).await.unwrap();
    let c = store.create(new_job("c")).await.unwrap();

    let reserved = pool.submit(a.clone()).await.unwrap();
    assert_eq!(reserved.status, JobStatus::running());
    assert_eq!(reserved.version, a.version + 1);
    assert_eq!(pool.status(), PoolStatus::Accepting);

    pool.submit(b).await.unwrap();
    assert_eq!(pool.status(), PoolStatus::Full);
    assert_eq!(pool.busy_count(), 2);

    let err = pool.submit(c.clone()).await.unwrap_err();
    assert_eq!(err, PoolError::Busy);
    // Nothing was queued: the third job is untouched.
    assert_eq!(store.get(c.id).await.unwrap().version, c.version);
    assert!(store.get(c.id).await.unwrap().is_pending());

    gate.open(1);
    assert_eventually(
        || async { pool.status() == PoolStatus::Accepting },
        Duration::from_secs(5),
        "a finished slot should reopen the pool",
    )
    .await;
    pool.submit(c).await.unwrap();

    gate.open(2);
    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_pool_status_edges_for_single_slot() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pool = start_pool(store.clone(), 1, gate.factory());
    wait_all_idle(&pool).await;
    let mut status_rx = pool.subscribe();
    status_rx.borrow_and_update();

    let job = store.create(new_job("one")).await.unwrap();
    pool.submit(job.clone()).await.unwrap();
    assert!(status_rx.has_changed().unwrap());
    assert_eq!(*status_rx.borrow_and_update(), PoolStatus::Full);

    gate.open(1);
    tokio::time::timeout(Duration::from_secs(5), status_rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*status_rx.borrow_and_update(), PoolStatus::Accepting);

    let done = wait_for_status(&store, &job, JobStatus::done(ExitStatus::Success)).await;
    assert!(done.processing.finished.is_some());
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_submit_rejects_non_pending_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pool = start_pool(store.clone(), 2, gate.factory());
    wait_all_idle(&pool).await;

    let job = store.create(new_job("x")).await.unwrap();
    let reserved = pool.submit(job).await.unwrap();

    let err = pool.submit(reserved.clone()).await.unwrap_err();
    assert_eq!(
        err,
        PoolError::NotPending {
            job_id: reserved.id,
            run: RunStatus::Running,
        }
    );
    assert!(err.is_declined());

    gate.open(1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_pools_reserve_once() {
    let store = Arc::new(MemoryJobStore::new());
    let gate = Gate::new();
    let pools: Vec<WorkerPool> = (0..4)
        .map(|_| start_pool(store.clone(), 1, gate.factory()))
        .collect();
    for pool in &pools {
        wait_all_idle(pool).await;
    }

    let job = store.create(new_job("contested")).await.unwrap();
    let attempts = pools.iter().map(|pool| {
        let pool = pool.clone();
        let job = job.clone();
        tokio::spawn(async move { pool.submit(job).await })
    });
    let mut winners = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        match attempt.await.unwrap() {
            Ok(_) => winners += 1,
            Err(PoolError::Reservation(e)) => assert!(e.is_locking_failed()),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    // Losers stay open for other work.
    let accepting = pools
        .iter()
        .filter(|p| p.status() == PoolStatus::Accepting)
        .count();
    assert_eq!(accepting, 3);

    gate.open(1);
    for pool in &pools {
        pool.shutdown(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
async fn test_processor_error_is_recorded_as_failure() {
    let store = Arc::new(MemoryJobStore::new());
    let factory = Arc::new(FnProcessorFactory::new(
        |_job: Job, _shutdown: CancellationToken| async move {
            Err(ProcessorError::Failed("disk full".to_string()))
        },
    ));
    let pool = start_pool(store.clone(), 1, factory);
    wait_all_idle(&pool).await;

    let job = store.create(new_job("boom")).await.unwrap();
    pool.submit(job.clone()).await.unwrap();

    let failed = wait_for_status(&store, &job, JobStatus::done(ExitStatus::Failure)).await;
    let error = failed.result.unwrap()["error"].as_str().unwrap().to_string();
    assert!(error.contains("disk full"));
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_processor_can_requeue_its_job() {
    let store = Arc::new(MemoryJobStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let factory = Arc::new(FnProcessorFactory::new(
        move |mut job: Job, _shutdown: CancellationToken| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    job.status = JobStatus::pending();
                }
                Ok(job)
            }
        },
    ));
    let pool = start_pool(store.clone(), 1, factory);
    wait_all_idle(&pool).await;

    let job = store.create(new_job("twice")).await.unwrap();
    pool.submit(job.clone()).await.unwrap();
    assert_eventually(
        || async {
            let stored = store.get(job.id).await.unwrap();
            stored.is_pending() && stored.version == job.version + 2
        },
        Duration::from_secs(5),
        "processor should hand the job back",
    )
    .await;
    let requeued = store.get(job.id).await.unwrap();
    assert!(requeued.processing.started.is_none());
    assert!(requeued.processing.finished.is_none());

    pool.submit(requeued.clone()).await.unwrap();
    wait_for_status(&store, &job, JobStatus::done(ExitStatus::Success)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shell_jobs_run_to_completion() {
    let store = Arc::new(MemoryJobStore::new());
    let pool = start_pool(store.clone(), 2, Arc::new(ShellProcessorFactory::new()));
    wait_all_idle(&pool).await;

    let ok = store
        .create(jobmesh::scheduler::NewJob::new("shell", "echo").with_args(["echo", "hello"]))
        .await
        .unwrap();
    let bad = store
        .create(jobmesh::scheduler::NewJob::new("shell", "echo").with_args(["false"]))
        .await
        .unwrap();
    pool.submit(ok.clone()).await.unwrap();
    pool.submit(bad.clone()).await.unwrap();

    let ok = wait_for_status(&store, &ok, JobStatus::done(ExitStatus::Success)).await;
    assert_eq!(ok.result.unwrap()["stdout"], "hello\n");
    let bad = wait_for_status(&store, &bad, JobStatus::done(ExitStatus::Failure)).await;
    assert_eq!(bad.result.unwrap()["exit_code"], 1);

    pool.shutdown(Duration::from_secs(1)).await;
}
