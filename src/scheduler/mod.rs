//! Durable job queue and the scheduler that drains it.
//!
//! - **JobQueue**: enqueue, status, listing, and the attempt/backoff policy
//! - **JobStore**: storage capability (Redis or in-memory) with atomic claim
//!   and compare-and-set transitions
//! - **JobExecutor**: one attempt = one dispatch plus progress reports
//! - **JobScheduler**: runner tasks, maintenance loop, graceful shutdown
//!
//! # Lifecycle
//!
//! ```text
//!  enqueue ──► waiting ──claim──► active ──success──► completed
//!                 ▲                  │
//!                 │               failure
//!                 │                  │
//!                 └──promote── delayed ◄── attempts left
//!                                    │
//!                                    └──── budget spent ──► failed
//! ```
//!
//! Callers see `waiting` and `delayed` as `pending` and `active` as
//! `processing`. Completed and failed jobs are kept for the retention window
//! and then removed.
//!
//! # Example
//!
//! ```rust,ignore
//! use prompt_relay::scheduler::{JobQueue, QueueSettings};
//!
//! let queue = JobQueue::connect(
//!     "redis://localhost:6379",
//!     "prompt-relay",
//!     Duration::from_secs(86400),
//!     QueueSettings::new(3),
//! )
//! .await?;
//!
//! let id = queue.enqueue("Find the pricing page of acme.io", None).await?;
//! let view = queue.get_status(id).await?;
//! ```

pub mod executor;
pub mod job;
pub mod pagination;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod worker_pool;

// Re-export main types for convenience
pub use executor::JobExecutor;
pub use job::{
    JobPayload, JobProgress, JobRecord, JobState, JobStatus, JobView, ProgressStage, RetryPolicy,
};
pub use pagination::{PageToken, Pagination};
pub use queue::{JobPage, JobQueue, QueueCounts, QueueError, QueueSettings};
pub use redis_store::RedisJobStore;
pub use store::{JobStore, MemoryJobStore};
pub use worker_pool::{JobScheduler, SchedulerConfig, SchedulerError, SchedulerStats};
