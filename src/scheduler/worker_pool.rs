//! Job scheduler: runner tasks pulling jobs from the queue.
//!
//! The scheduler spawns a fixed number of runners over a shared
//! [`JobQueue`]. Each runner claims one job at a time, executes a single
//! attempt under the job's timeout and writes the outcome back.
//!
//! # Features
//!
//! - Bounded concurrency (one job per runner)
//! - Stalled-job recovery on start
//! - Outcome writes retried with exponential backoff on transient errors
//! - Maintenance loop promoting due retries, failing overdue attempts and
//!   purging expired jobs
//! - Graceful shutdown with broadcast channel
//! - Scheduler statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use std::future::Future;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::executor::JobExecutor;
use super::job::{JobRecord, JobState, ProgressStage};
use super::queue::{JobQueue, QueueError};
use crate::config::RelayConfig;

/// Maximum number of tries to persist an attempt outcome.
const OUTCOME_WRITE_TRIES: u32 = 5;

/// Base delay between outcome write tries in milliseconds.
const OUTCOME_RETRY_DELAY_MS: u64 = 100;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Scheduler configuration is unusable.
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Scheduler is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Number of runner tasks, i.e. jobs executing at once.
    pub concurrency: usize,
    /// How often idle runners poll and delayed jobs are promoted.
    pub poll_interval: Duration,
    /// How often expired jobs are purged.
    pub purge_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// How long an active attempt may outlive its timeout before the
    /// maintenance loop fails it.
    pub stall_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_secs(1),
            purge_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            stall_grace: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with the specified number of runners.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Derives the scheduler settings from the relay configuration.
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self::new(config.effective_concurrency()).with_poll_interval(config.poll_interval)
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the purge interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the grace period before overdue attempts are failed.
    pub fn with_stall_grace(mut self, grace: Duration) -> Self {
        self.stall_grace = grace;
        self
    }
}

/// Statistics about the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    /// Number of runner tasks.
    pub concurrency: usize,
    /// Number of runners currently executing a job.
    pub active_runners: usize,
    /// Attempts that completed their job.
    pub jobs_completed: u64,
    /// Attempts that failed their job for good.
    pub jobs_failed: u64,
    /// Failed attempts that were scheduled for retry.
    pub jobs_retried: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl SchedulerStats {
    /// Returns the number of jobs that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking scheduler statistics.
struct SharedStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_runners: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_runners: AtomicU64::new(0),
        }
    }

    fn record_attempt(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_completion(&self, duration: Duration) {
        self.record_attempt(&self.jobs_completed, duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.record_attempt(&self.jobs_failed, duration);
    }

    fn record_retry(&self, duration: Duration) {
        self.record_attempt(&self.jobs_retried, duration);
    }

    fn increment_active(&self) {
        self.active_runners.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_runners.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, concurrency: usize) -> SchedulerStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_job_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        SchedulerStats {
            concurrency,
            active_runners: self.active_runners.load(Ordering::SeqCst) as usize,
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

/// Runs queued jobs with bounded concurrency.
pub struct JobScheduler {
    config: SchedulerConfig,
    queue: JobQueue,
    executor: JobExecutor,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedStats>,
    is_running: AtomicBool,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, queue: JobQueue, executor: JobExecutor) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            executor,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers stalled jobs, then starts the runners and the maintenance
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the scheduler is already
    /// running, `SchedulerError::InvalidConfig` for zero concurrency.
    pub async fn start(&mut self) -> Result<(), SchedulerError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.config.concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }

        // Jobs left active by a previous run would otherwise never finish
        match self.queue.recover_stalled().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "Recovered stalled jobs");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover stalled jobs");
            }
        }

        for index in 1..=self.config.concurrency {
            let runner = Runner {
                id: index,
                queue: self.queue.clone(),
                executor: self.executor.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };

            let span = info_span!("runner", runner = index);
            self.handles
                .push(tokio::spawn(async move { runner.run().instrument(span).await }));
        }

        let maintenance = maintain(
            self.queue.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.handles.push(tokio::spawn(maintenance));

        self.is_running.store(true, Ordering::SeqCst);
        info!(concurrency = self.config.concurrency, "Scheduler started");

        Ok(())
    }

    /// Gracefully shuts down the runners.
    ///
    /// Runners finish the attempt they are executing before stopping.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if runners don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");

        // Ignore send error - runners may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Runner task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Scheduler shutdown complete");
                Ok(())
            }
            Err(_) => Err(SchedulerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot(self.config.concurrency)
    }

    /// Returns whether the scheduler is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

/// Promotes due retries and fails overdue attempts every poll interval, and
/// purges expired jobs every purge interval, until shutdown.
async fn maintain(
    queue: JobQueue,
    config: SchedulerConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_purge = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = queue.promote_due().await {
            warn!(error = %e, "Failed to promote delayed jobs");
        }

        match queue.fail_overdue(config.stall_grace).await {
            Ok(failed) if failed > 0 => warn!(failed, "Failed overdue attempts"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to sweep overdue attempts"),
        }

        if last_purge.elapsed() >= config.purge_interval {
            last_purge = Instant::now();
            if let Err(e) = queue.purge_expired().await {
                warn!(error = %e, "Failed to purge expired jobs");
            }
        }
    }

    debug!("Maintenance loop stopped");
}

/// A single runner executing one job at a time.
struct Runner {
    id: usize,
    queue: JobQueue,
    executor: JobExecutor,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedStats>,
}

impl Runner {
    /// Claims and executes jobs until a shutdown signal is received.
    async fn run(mut self) {
        debug!(runner = self.id, "Runner started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.claim_next().await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(runner = self.id, "Runner stopped");
    }

    /// Executes one attempt and records its outcome.
    async fn process_job(&self, job: JobRecord) {
        let job_id = job.id;
        let started = Instant::now();

        info!(job_id = %job_id, attempt = job.attempts_made, "Processing job");

        self.stats.increment_active();
        let result = tokio::time::timeout(job.timeout(), self.executor.execute(&job)).await;
        let duration = started.elapsed();
        self.stats.decrement_active();

        match result {
            Ok(Ok(output)) => {
                let used_worker = output.used_worker;
                let written = self
                    .persist(job_id, || self.queue.complete(&job, output.clone()))
                    .await;
                match written {
                    Ok(_) => {
                        self.stats.record_completion(duration);
                        info!(
                            job_id = %job_id,
                            worker = used_worker,
                            duration_ms = duration.as_millis() as u64,
                            "Job completed"
                        );
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to mark job complete");
                    }
                }
            }
            Ok(Err(e)) => self.fail(&job, &e.to_string(), duration).await,
            Err(_) => {
                self.executor
                    .report(job_id, ProgressStage::Failed, job.payload.preferred_worker)
                    .await;
                let reason = format!("Job timed out after {}ms", job.timeout_ms);
                self.fail(&job, &reason, duration).await;
            }
        }
    }

    async fn fail(&self, job: &JobRecord, reason: &str, duration: Duration) {
        let written = self
            .persist(job.id, || self.queue.record_failure(job, reason))
            .await;
        match written {
            Ok(updated) if updated.state == JobState::Failed => {
                self.stats.record_failure(duration)
            }
            Ok(_) => self.stats.record_retry(duration),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }
    }

    /// Writes an attempt outcome, retrying transient store errors with
    /// exponential backoff (100ms, 200ms, 400ms, ...).
    async fn persist<F, Fut>(&self, job_id: Uuid, write: F) -> Result<JobRecord, QueueError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<JobRecord, QueueError>>,
    {
        let mut tries = 1;
        loop {
            match write().await {
                Err(e) if e.is_transient() && tries < OUTCOME_WRITE_TRIES => {
                    let delay_ms = OUTCOME_RETRY_DELAY_MS * (1 << (tries - 1));
                    warn!(
                        job_id = %job_id,
                        attempt = tries,
                        max_tries = OUTCOME_WRITE_TRIES,
                        delay_ms,
                        error = %e,
                        "Transient error writing job outcome, will retry"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    tries += 1;
                }
                result => return result,
            }
        }
    }
}
