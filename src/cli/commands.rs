//! CLI command definitions for prompt-relay.
//!
//! Every command reads its settings from `RELAY_*` environment variables
//! (see [`RelayConfig::from_env`]) and prints pretty JSON to stdout.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::scheduler::{
    JobExecutor, JobQueue, JobScheduler, JobStatus, QueueSettings, RetryPolicy, SchedulerConfig,
};
use crate::workers::{HealthAggregator, HttpTransport, Outcome, WorkerClient, WorkerRegistry};

/// How often `run` checks whether its job has finished.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Prompt job queue with failover across a pool of remote workers.
#[derive(Parser)]
#[command(name = "prompt-relay")]
#[command(about = "Queue prompts and dispatch them across a pool of remote workers")]
#[command(version)]
#[command(
    long_about = "prompt-relay queues natural-language prompts and dispatches each one to a fixed pool of remote search workers, failing over from busy workers to the next.\n\nWorkers are configured with RELAY_WORKER_URLS (comma-separated, in priority order).\n\nExample usage:\n  prompt-relay submit \"Find the pricing page of acme.io\"\n  prompt-relay status <JOB_ID>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler against the Redis queue until Ctrl-C.
    Serve(ServeArgs),

    /// Enqueue a prompt and print its job id.
    Submit(SubmitArgs),

    /// Print the status of a job.
    Status(StatusArgs),

    /// List jobs, newest first.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Print the number of jobs per status.
    Counts,

    /// Check every worker and print pool health.
    Health,

    /// Send an admin command to one worker.
    Worker(WorkerArgs),

    /// Execute one prompt in-process and print the finished job.
    ///
    /// Uses an in-memory queue, so no Redis is needed.
    Run(RunArgs),
}

/// Arguments for `prompt-relay serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Number of jobs executed at once (defaults to the worker count).
    #[arg(short = 'c', long, env = "RELAY_CONCURRENCY")]
    pub concurrency: Option<usize>,
}

/// Arguments for `prompt-relay submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Prompt to dispatch.
    pub prompt: String,

    /// Preferred worker (1-based). Stored with the job; dispatch still
    /// starts from worker 1.
    #[arg(short = 'w', long)]
    pub worker: Option<usize>,
}

/// Arguments for `prompt-relay status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id returned by `submit`.
    pub job_id: Uuid,
}

/// Arguments for `prompt-relay list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only list jobs with this status (pending, processing, completed, failed).
    #[arg(short, long)]
    pub status: Option<JobStatus>,

    /// Page size (1-100, default 50).
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Token from the previous page's `nextPageToken`.
    #[arg(short, long)]
    pub page_token: Option<String>,
}

/// Arguments for `prompt-relay worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker index (1-based).
    pub index: usize,

    /// Action to perform.
    #[command(subcommand)]
    pub action: WorkerAction,
}

/// Worker admin actions.
#[derive(clap::Subcommand, Debug, Clone, Copy)]
pub enum WorkerAction {
    /// Refresh the worker's upstream session.
    Refresh,
    /// Restart the worker's browser.
    Restart,
    /// Open a fresh search tab.
    Warmup,
}

/// Arguments for `prompt-relay run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Prompt to dispatch.
    pub prompt: String,

    /// Preferred worker (1-based).
    #[arg(short = 'w', long)]
    pub worker: Option<usize>,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value = "900")]
    pub wait_secs: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;

    match cli.command {
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::List(args) => run_list_command(config, args).await,
        Commands::Counts => run_counts_command(config).await,
        Commands::Health => run_health_command(config).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Run(args) => run_run_command(config, args).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn build_client(config: &RelayConfig) -> anyhow::Result<WorkerClient> {
    let registry = Arc::new(WorkerRegistry::from_urls(&config.worker_urls)?);
    let transport = HttpTransport::new(registry)?;
    Ok(WorkerClient::new(Arc::new(transport), config.timeouts.clone()))
}

fn queue_settings(config: &RelayConfig) -> QueueSettings {
    QueueSettings::new(config.worker_urls.len())
        .with_retry(RetryPolicy::new(config.job_attempts, config.job_backoff))
        .with_job_timeout(config.job_timeout)
}

fn memory_queue(config: &RelayConfig) -> JobQueue {
    JobQueue::in_memory_with_retention(config.job_retention, queue_settings(config))
}

async fn connect_queue(config: &RelayConfig) -> anyhow::Result<JobQueue> {
    let queue = JobQueue::connect(
        &config.redis_url,
        &config.queue_name,
        config.job_retention,
        queue_settings(config),
    )
    .await?;
    Ok(queue)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_serve_command(config: RelayConfig, args: ServeArgs) -> anyhow::Result<()> {
    let client = build_client(&config)?;
    let queue = connect_queue(&config).await?;

    let health = HealthAggregator::new(client.clone()).check().await;
    info!(
        status = %health.status,
        healthy = health.healthy,
        total = health.total,
        "Worker pool checked"
    );

    let mut scheduler_config = SchedulerConfig::from_relay_config(&config);
    if let Some(concurrency) = args.concurrency {
        scheduler_config.concurrency = concurrency;
    }

    let executor = JobExecutor::new(Dispatcher::new(client), queue.clone());
    let mut scheduler = JobScheduler::new(scheduler_config, queue, executor);
    scheduler.start().await?;

    info!(
        queue = %config.queue_name,
        workers = config.worker_urls.len(),
        "Serving, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    scheduler.shutdown().await?;
    let stats = scheduler.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        "Scheduler stopped"
    );

    Ok(())
}

async fn run_submit_command(config: RelayConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    let job_id = queue.enqueue(&args.prompt, args.worker).await?;
    print_json(&json!({ "jobId": job_id }))
}

async fn run_status_command(config: RelayConfig, args: StatusArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    let view = queue.get_status(args.job_id).await?;
    print_json(&view)
}

async fn run_list_command(config: RelayConfig, args: ListArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    let page = queue
        .list_jobs(args.status, args.limit, args.page_token.as_deref())
        .await?;
    print_json(&page)
}

async fn run_counts_command(config: RelayConfig) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    print_json(&queue.counts().await?)
}

async fn run_health_command(config: RelayConfig) -> anyhow::Result<()> {
    let client = build_client(&config)?;
    let health = HealthAggregator::new(client).check().await;
    print_json(&health)
}

async fn run_worker_command(config: RelayConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let client = build_client(&config)?;
    let worker = args.index;

    let outcome = match args.action {
        WorkerAction::Refresh => client.refresh_session(worker).await?,
        WorkerAction::Restart => client.restart_browser(worker).await?,
        WorkerAction::Warmup => client.open_search_tab(worker).await?,
    };

    let output = match outcome {
        Outcome::Ok(body) => json!({ "worker": worker, "ok": true, "response": body }),
        Outcome::Fail(failure) => {
            warn!(worker, kind = %failure.kind, "Worker command failed");
            json!({
                "worker": worker,
                "ok": false,
                "status": failure.status,
                "kind": failure.kind.as_str(),
                "error": failure.message,
            })
        }
    };
    print_json(&output)
}

async fn run_run_command(config: RelayConfig, args: RunArgs) -> anyhow::Result<()> {
    let client = build_client(&config)?;
    let queue = memory_queue(&config);
    let executor = JobExecutor::new(Dispatcher::new(client), queue.clone());

    let mut scheduler = JobScheduler::new(
        SchedulerConfig::from_relay_config(&config).with_poll_interval(RUN_POLL_INTERVAL),
        queue.clone(),
        executor,
    );
    scheduler.start().await?;

    let job_id = queue.enqueue(&args.prompt, args.worker).await?;
    let finished = tokio::time::timeout(
        Duration::from_secs(args.wait_secs),
        queue.wait_until_finished(job_id, RUN_POLL_INTERVAL),
    )
    .await;

    scheduler.shutdown().await?;

    match finished {
        Ok(view) => print_json(&view?),
        Err(_) => anyhow::bail!(
            "Job {} did not finish within {}s; last status: {}",
            job_id,
            args.wait_secs,
            queue.get_status(job_id).await?.status
        ),
    }
}
