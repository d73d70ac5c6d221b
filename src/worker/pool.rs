use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{MeshError, PoolError, ProcessorError};
use crate::scheduler::{ExitStatus, Job, JobStatus, RunStatus};
use crate::worker::monitor::{AggregateStatus, SlotId, SlotStatus, StatusMonitor};
use crate::worker::processor::ProcessorFactory;
use crate::worker::reservation::ReservationClient;

pub use crate::worker::monitor::PoolStatus;

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Slots that exited within the grace period.
    pub completed_slots: usize,
    /// Jobs still running after the grace period, forced to DONE/ABORTED.
    pub aborted_jobs: Vec<crate::scheduler::JobId>,
}

struct PoolInner {
    config: PoolConfig,
    monitor: Arc<StatusMonitor>,
    client: ReservationClient,
    factory: Arc<dyn ProcessorFactory>,
    senders: Vec<mpsc::Sender<Job>>,
    /// Serializes dispatch: find idle slot, reserve, hand over.
    dispatch: Mutex<()>,
    shutting_down: AtomicBool,
    terminated: AtomicBool,
    shutdown: CancellationToken,
    in_flight: StdMutex<HashMap<SlotId, Job>>,
}

impl PoolInner {
    fn set_slot(&self, slot: SlotId, status: SlotStatus) {
        if let Err(e) = self.monitor.status_for(slot, status) {
            tracing::error!(slot, error = %e, "Failed to record slot status");
        }
    }

    fn track(&self, slot: SlotId, job: Option<Job>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match job {
            Some(job) => {
                in_flight.insert(slot, job);
            }
            None => {
                in_flight.remove(&slot);
            }
        }
    }

    fn take_in_flight(&self) -> Vec<Job> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.drain().map(|(_, job)| job).collect()
    }
}

/// Fixed set of worker slots fed one job at a time.
///
/// Jobs enter only through [`submit`](Self::submit), which reserves the job in
/// the store and hands it to an idle slot in one exclusive step. There is no
/// queue: when no slot is idle the caller gets [`PoolError::Busy`].
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Spawn `config.capacity` slot tasks on the current runtime.
    pub fn start(
        config: PoolConfig,
        client: ReservationClient,
        factory: Arc<dyn ProcessorFactory>,
    ) -> Result<Self, MeshError> {
        if config.capacity == 0 {
            return Err(MeshError::Config(
                "worker pool capacity must be at least 1".to_string(),
            ));
        }

        let monitor = Arc::new(StatusMonitor::new(config.capacity));
        let mut senders = Vec::with_capacity(config.capacity);
        let mut receivers = Vec::with_capacity(config.capacity);
        for _ in 0..config.capacity {
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(PoolInner {
            config,
            monitor,
            client,
            factory,
            senders,
            dispatch: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            in_flight: StdMutex::new(HashMap::new()),
        });

        let tasks = receivers
            .into_iter()
            .enumerate()
            .map(|(slot, rx)| tokio::spawn(run_slot(inner.clone(), slot, rx)))
            .collect();

        tracing::info!(capacity = inner.config.capacity, "Worker pool started");

        Ok(Self {
            inner,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// Reserve `job` and hand it to an idle slot.
    ///
    /// Returns the reserved job (status RUNNING, new version).
    pub async fn submit(&self, job: Job) -> Result<Job, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        if job.status.run != RunStatus::Pending {
            return Err(PoolError::NotPending {
                job_id: job.id,
                run: job.status.run,
            });
        }

        let _guard = self.inner.dispatch.lock().await;
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        if self.status() == PoolStatus::Full {
            return Err(PoolError::Busy);
        }

        let mut job = job;
        for slot in self.inner.monitor.idle_slots() {
            let reserved = self.inner.client.reserve(&job).await?;
            self.inner.set_slot(slot, SlotStatus::Busy);

            match self.inner.senders[slot].try_send(reserved.clone()) {
                Ok(()) => {
                    tracing::info!(job_id = %reserved.id, slot, "Job assigned to slot");
                    return Ok(reserved);
                }
                Err(_) => {
                    // The slot is gone; leave it BUSY so it is never offered again.
                    tracing::error!(job_id = %reserved.id, slot, "Slot unavailable, releasing job");
                    job = self.inner.client.release(&reserved).await?;
                }
            }
        }

        Err(PoolError::Busy)
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.monitor.pool_status()
    }

    pub fn aggregate(&self) -> AggregateStatus {
        self.inner.monitor.aggregate()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn busy_count(&self) -> usize {
        self.inner.monitor.count(SlotStatus::Busy)
    }

    pub fn monitor(&self) -> &Arc<StatusMonitor> {
        &self.inner.monitor
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolStatus> {
        self.inner.monitor.watch_pool()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, give in-flight jobs `grace` to finish, then abort
    /// the remaining slots and write their jobs as DONE/ABORTED.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        {
            let _guard = self.inner.dispatch.lock().await;
            if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
                return ShutdownReport::default();
            }
        }
        tracing::info!(grace_ms = grace.as_millis() as u64, "Worker pool shutting down");
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();
        let mut aborted = Vec::new();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.completed_slots += 1,
                Err(_) => {
                    handle.abort();
                    aborted.push(handle);
                }
            }
        }
        for handle in aborted {
            let _ = handle.await;
        }

        for mut job in self.inner.take_in_flight() {
            tracing::warn!(job_id = %job.id, "Aborting job still running after grace period");
            job.status = JobStatus::done(ExitStatus::Aborted);
            job.result = Some(json!({ "error": "runner shut down before the job finished" }));
            match self.inner.client.update(&job).await {
                Ok(_) => report.aborted_jobs.push(job.id),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to abort job")
                }
            }
        }

        self.inner.terminated.store(true, Ordering::SeqCst);
        tracing::info!(
            completed_slots = report.completed_slots,
            aborted_jobs = report.aborted_jobs.len(),
            "Worker pool terminated"
        );
        report
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.inner.config.capacity)
            .field("monitor", &self.inner.monitor)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// One slot: wait for a job, run it, write the result, report idle.
async fn run_slot(inner: Arc<PoolInner>, slot: SlotId, mut rx: mpsc::Receiver<Job>) {
    inner.set_slot(slot, SlotStatus::Idle);

    while !inner.shutdown.is_cancelled() {
        let job = match tokio::time::timeout(inner.config.worker_wait_timeout, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => continue,
        };

        inner.track(slot, Some(job.clone()));
        run_job(&inner, slot, job).await;
        inner.track(slot, None);
        inner.set_slot(slot, SlotStatus::Idle);
    }

    // A job handed over just before shutdown was never started.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        match inner.client.release(&job).await {
            Ok(_) => tracing::info!(job_id = %job.id, slot, "Released unstarted job"),
            Err(e) => tracing::error!(job_id = %job.id, slot, error = %e, "Failed to release job"),
        }
    }
    tracing::debug!(slot, "Worker slot stopped");
}

async fn run_job(inner: &PoolInner, slot: SlotId, job: Job) {
    if job.status.run != RunStatus::Running {
        let e = ProcessorError::NotReserved(job.id);
        tracing::error!(job_id = %job.id, slot, error = %e, "Refusing to process job");
        return;
    }

    let processor = inner.factory.create_for(&job, inner.shutdown.child_token());
    let finished = match processor.process().await {
        Ok(output) => complete(&job, output),
        Err(e) => {
            tracing::warn!(job_id = %job.id, slot, error = %e, "Job processor failed");
            let mut failed = job.clone();
            failed.status = JobStatus::done(ExitStatus::Failure);
            failed.result = Some(json!({ "error": e.to_string() }));
            failed
        }
    };

    match inner.client.update(&finished).await {
        Ok(updated) => tracing::info!(
            job_id = %updated.id,
            slot,
            status = %updated.status,
            version = updated.version,
            "Job result written"
        ),
        Err(e) => tracing::error!(
            job_id = %finished.id,
            slot,
            error = %e,
            "Job result could not be written"
        ),
    }
}

/// Merge processor output into the reserved job.
///
/// A processor that hands the job back as PENDING re-queues it. Anything else
/// finishes the job: DONE with the processor's exit, or SUCCESS if it set none.
fn complete(reserved: &Job, output: Job) -> Job {
    let mut finished = reserved.clone();
    finished.result = output.result;
    finished.status = match output.status.run {
        RunStatus::Pending => JobStatus::pending(),
        RunStatus::Running | RunStatus::Done => {
            JobStatus::done(output.status.exit.unwrap_or(ExitStatus::Success))
        }
    };
    finished
}
