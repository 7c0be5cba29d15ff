//! Error types for prompt-relay operations.
//!
//! Defines the error types shared across subsystems:
//! - Worker transport and registry lookups
//! - Pool dispatch outcomes that stop a dispatch attempt
//!
//! Queue, scheduler and configuration errors live next to their modules.

use thiserror::Error;

/// Errors raised at the worker transport boundary.
///
/// Transport, HTTP and body-parse failures are *not* errors here: they are
/// reported as [`crate::workers::Outcome::Fail`] values. Only requests that
/// cannot be issued at all end up in this enum.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid worker index {index}: expected a value in 1..={count}")]
    InvalidWorkerIndex { index: usize, count: usize },

    #[error("Invalid worker endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Worker registry is empty")]
    EmptyRegistry,

    #[error("HTTP client initialization failed: {0}")]
    ClientInit(String),
}

/// Errors that end a single dispatch attempt.
///
/// Busy and warming-up workers never appear here; the dispatcher recovers
/// from them by moving on to the next worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker {worker} reported upstream blocking: {message}")]
    UpstreamBlocked { worker: usize, message: String },

    #[error("All {tried} workers exhausted, last error: {last_error}")]
    AllWorkersExhausted { tried: usize, last_error: String },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_display() {
        let err = WorkerError::InvalidWorkerIndex { index: 4, count: 3 };
        assert!(err.to_string().contains("1..=3"));
        assert!(err.to_string().contains('4'));

        let err = WorkerError::EmptyRegistry;
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::UpstreamBlocked {
            worker: 2,
            message: "captcha".to_string(),
        };
        assert!(err.to_string().contains("Worker 2"));
        assert!(err.to_string().contains("captcha"));

        let err = DispatchError::AllWorkersExhausted {
            tried: 3,
            last_error: "Worker is busy".to_string(),
        };
        assert!(err.to_string().contains("All 3 workers"));
        assert!(err.to_string().contains("busy"));
    }
}
