//! Worker pool dispatch with per-error-class failover.
//!
//! One dispatch walks the workers in ascending index order and stops at the
//! first terminal outcome:
//!
//! | Worker answer                          | Action                          |
//! |----------------------------------------|---------------------------------|
//! | success with non-empty `result.json`   | return, `usedWorker` = index    |
//! | 422 `empty_result`                     | return `json = ""` + `raw_text` |
//! | 503 `retry_other_worker`               | fail the dispatch immediately   |
//! | busy / locked / warming up             | next worker, no delay           |
//! | anything else                          | log, next worker                |
//!
//! Exhausting the pool is reported as
//! [`DispatchError::AllWorkersExhausted`](crate::error::DispatchError), which
//! the scheduler retries as a whole after backoff. A single dispatch never
//! calls the same worker twice.

pub mod pool;

pub use pool::{DispatchOutput, Dispatcher};
