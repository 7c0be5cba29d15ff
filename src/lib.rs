//! prompt-relay: prompt job queue with sequential failover across a fixed
//! pool of remote search workers.
//!
//! Prompts are enqueued and executed asynchronously. Each attempt walks the
//! worker pool in order, skipping busy workers, and the queue retries whole
//! attempts with exponential backoff until the job completes or its attempt
//! budget is spent.

// Core modules
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod scheduler;
pub mod workers;

// Re-export commonly used types
pub use config::{ConfigError, RelayConfig, WorkerTimeouts};
pub use dispatch::{DispatchOutput, Dispatcher};
pub use error::{DispatchError, WorkerError};
pub use scheduler::{JobQueue, JobScheduler, JobStatus, JobView, QueueError};
