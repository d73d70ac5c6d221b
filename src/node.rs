use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::runner_router;
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::scheduler::{NewRunner, Runner, RunnerId, RunnerStatus};
use crate::store::{RunnerPatch, SharedJobStore, SharedRunnerStore};
use crate::worker::{
    HeartbeatReporter, JobFeeder, ProcessorFactory, ReservationClient, ShutdownReport, WorkerPool,
};

/// One runner: a registered worker pool with its feeder and heartbeat.
pub struct RunnerNode {
    config: RunnerConfig,
    runner: Runner,
    pool: WorkerPool,
    runners: SharedRunnerStore,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RunnerNode {
    /// Register with the registry and start all runner subsystems.
    ///
    /// This is the main entry point for a runner:
    /// 1. Registers the runner (status RUNNING until a slot reports idle)
    /// 2. Starts the worker pool and its status monitor
    /// 3. Spawns the heartbeat reporter, driven by the pool's aggregate status
    /// 4. Spawns the job feeder, driven by the pool's ACCEPTING edges
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or registration fails.
    pub async fn start(
        config: RunnerConfig,
        jobs: SharedJobStore,
        runners: SharedRunnerStore,
        factory: Arc<dyn ProcessorFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let runner = runners
            .register(NewRunner {
                callback: config.callback.clone(),
                competencies: config.competencies.clone(),
                ttl: config.heartbeat.ttl,
            })
            .await?;

        let client = ReservationClient::new(jobs.clone(), config.retry.clone());
        let pool = match WorkerPool::start(config.pool.clone(), client, factory) {
            Ok(pool) => pool,
            Err(e) => {
                let _ = runners.remove(runner.id).await;
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let heartbeat = HeartbeatReporter::new(
            runner.id,
            runners.clone(),
            config.heartbeat.clone(),
            pool.monitor().watch_aggregate(),
        );
        let feeder = JobFeeder::new(
            pool.clone(),
            jobs,
            &config.competencies,
            config.feeder.clone(),
        );
        let tasks = vec![
            tokio::spawn(heartbeat.run(shutdown.clone())),
            tokio::spawn(feeder.run(shutdown.clone())),
        ];

        tracing::info!(
            runner_id = %runner.id,
            callback = %runner.callback,
            capacity = config.pool.capacity,
            "Runner started"
        );

        Ok(Self {
            config,
            runner,
            pool,
            runners,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> RunnerId {
        self.runner.id
    }

    /// The registration as it was accepted at start-up.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Callback endpoint the registry pushes jobs to.
    pub fn router(&self) -> Router {
        runner_router(self.pool.clone())
    }

    /// Stop feeding, drain the pool within the configured grace period and
    /// report the runner DISCONNECTED.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(runner_id = %self.runner.id, error = %e, "Runner task failed");
            }
        }

        let report = self.pool.shutdown(self.config.pool.shutdown_grace).await;

        let patch = RunnerPatch::status(RunnerStatus::Disconnected);
        if let Err(e) = self.runners.patch(self.runner.id, patch).await {
            tracing::warn!(runner_id = %self.runner.id, error = %e, "Failed to report runner disconnected");
        }
        tracing::info!(runner_id = %self.runner.id, "Runner stopped");
        report
    }
}

impl std::fmt::Debug for RunnerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerNode")
            .field("runner_id", &self.runner.id)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
