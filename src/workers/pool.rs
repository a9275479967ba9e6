use super::error::PoolError;
use super::pipeline::TranscodePipeline;
use super::worker::{JobOutcome, Worker, WorkerSettings};
use crate::config::settings::{AppConfig, StoragePaths};
use crate::modules::jobs::{JobStore, QueueStats, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub paths: StoragePaths,
    pub delete_source_on_success: bool,
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval,
            paths: config.paths.clone(),
            delete_source_on_success: config.delete_source_on_success,
        }
    }
}

/// Counts of what the workers did during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub idle: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::NoJob | JobOutcome::Skipped => self.idle += 1,
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Failed { .. } | JobOutcome::CommitFailed { .. } => self.failed += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

/// A fixed set of workers driven by a poll loop.
///
/// Each tick moves every worker into its own task and waits for all of them
/// to hand themselves back, so a worker can never be given a second job while
/// one is still running, and in-flight jobs never exceed the worker count.
pub struct WorkerPool {
    workers: Vec<Worker>,
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Creates the output directories and the workers.
    pub async fn start(
        config: PoolConfig,
        store: Arc<dyn JobStore>,
        pipeline: TranscodePipeline,
    ) -> Result<Self, PoolError> {
        for dir in [&config.paths.encoded, &config.paths.thumbnails] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| PoolError::OutputDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let pipeline = Arc::new(pipeline);
        let settings = Arc::new(WorkerSettings {
            paths: config.paths,
            delete_source_on_success: config.delete_source_on_success,
        });

        let worker_count = config.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|id| Worker::new(id, store.clone(), pipeline.clone(), settings.clone()))
            .collect();

        Ok(Self {
            workers,
            store,
            poll_interval: config.poll_interval,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Gives every worker one claim-and-process attempt, concurrently, and
    /// waits for all of them to settle.
    pub async fn tick(&mut self) -> Result<TickReport, PoolError> {
        let mut tasks = JoinSet::new();
        for mut worker in self.workers.drain(..) {
            tasks.spawn(async move {
                let outcome = worker.run_once().await;
                (worker, outcome)
            });
        }

        let mut report = TickReport::default();
        let mut fatal: Option<PoolError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((worker, Ok(outcome))) => {
                    report.record(&outcome);
                    self.workers.push(worker);
                }
                Ok((worker, Err(e))) => {
                    error!(worker = worker.id(), "Failed to claim job: {}", e);
                    self.workers.push(worker);
                    fatal.get_or_insert(PoolError::Store(e));
                }
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    fatal.get_or_insert(PoolError::WorkerPanicked(e));
                }
            }
        }
        self.workers.sort_by_key(Worker::id);

        if let Some(e) = fatal {
            return Err(e);
        }

        if report.processed() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                "Tick finished"
            );
        } else {
            debug!(idle = report.idle, "Tick finished, queue empty");
        }
        Ok(report)
    }

    /// Runs ticks until `shutdown` fires or a fatal error occurs, then closes
    /// the store. A tick already running when `shutdown` fires is finished,
    /// not interrupted.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PoolError> {
        info!(
            workers = self.workers.len(),
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "🎥 Worker pool started"
        );

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if let Err(e) = self.tick().await {
                break Err(e);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        match &result {
            Ok(()) => info!("Worker pool stopped"),
            Err(e) => error!("Worker pool stopping on fatal error: {}", e),
        }
        self.store.close().await;
        result
    }

    /// Queue counts, for startup and shutdown logging.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats().await
    }
}
