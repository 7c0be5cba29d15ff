//! Remote worker access: registry, transport, typed client and health.
//!
//! Workers are opaque HTTP services addressed by their 1-based position in
//! the configured endpoint list:
//!
//! - **WorkerRegistry**: immutable ordered endpoint list
//! - **WorkerTransport**: one bounded call, failures as classified values
//! - **WorkerClient**: typed routes with per-route timeouts
//! - **HealthAggregator**: concurrent health checks reduced to pool status

pub mod client;
pub mod health;
#[cfg(test)]
pub(crate) mod mock;
pub mod registry;
pub mod transport;

pub use client::{SearchReply, SearchResult, WorkerClient};
pub use health::{HealthAggregator, PoolHealth, PoolStatus, WorkerHealth};
pub use registry::WorkerRegistry;
pub use transport::{
    FailureKind, HttpTransport, Outcome, WorkerCall, WorkerFailure, WorkerRoute, WorkerTransport,
};
