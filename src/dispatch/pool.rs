//! Sequential failover across the worker pool.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::workers::{FailureKind, SearchReply, WorkerClient, WorkerFailure};

/// Terminal output of a dispatch.
///
/// `json` is empty only for an empty-result answer, in which case `raw_text`
/// holds the text the worker captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutput {
    pub json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(rename = "usedWorker")]
    pub used_worker: usize,
}

impl DispatchOutput {
    /// Whether the worker found nothing and only raw text is available.
    pub fn is_degraded(&self) -> bool {
        self.json.is_empty()
    }
}

/// Tries workers `1..=count` in order, once each, until one produces a
/// terminal outcome.
///
/// There is no shared reservation over workers: each worker gates itself and
/// answers busy immediately, so concurrent dispatches simply race through
/// the same order.
#[derive(Clone)]
pub struct Dispatcher {
    client: WorkerClient,
}

impl Dispatcher {
    pub fn new(client: WorkerClient) -> Self {
        Self { client }
    }

    /// Number of workers a dispatch may try.
    pub fn worker_count(&self) -> usize {
        self.client.worker_count()
    }

    /// Runs one dispatch of `prompt`.
    ///
    /// # Errors
    ///
    /// - `DispatchError::UpstreamBlocked` as soon as a worker reports that the
    ///   upstream blocked it; later workers are not called.
    /// - `DispatchError::AllWorkersExhausted` when every worker was tried
    ///   without a terminal outcome. Carries the last failure seen.
    pub async fn dispatch(&self, prompt: &str) -> Result<DispatchOutput, DispatchError> {
        let count = self.client.worker_count();
        let mut last_error: Option<String> = None;

        for worker in 1..=count {
            let failure = match self.client.search(worker, prompt).await? {
                SearchReply::Found(result) if !result.json.is_empty() => {
                    info!(worker, "Search completed");
                    return Ok(DispatchOutput {
                        json: result.json,
                        raw_text: result.raw_text,
                        used_worker: worker,
                    });
                }
                SearchReply::Found(_) => {
                    WorkerFailure::transport("Worker returned an empty result.json")
                }
                SearchReply::Failed(failure) => failure,
            };

            match failure.kind {
                FailureKind::EmptyResult => {
                    info!(worker, "Search found nothing, completing with raw text");
                    return Ok(DispatchOutput {
                        json: String::new(),
                        raw_text: Some(failure.raw_text().unwrap_or_default().to_string()),
                        used_worker: worker,
                    });
                }
                FailureKind::Blocked => {
                    warn!(worker, error = %failure.message, "Upstream blocked worker, failing dispatch");
                    return Err(DispatchError::UpstreamBlocked {
                        worker,
                        message: failure.message,
                    });
                }
                FailureKind::Busy | FailureKind::WarmingUp => {
                    debug!(worker, kind = %failure.kind, "Worker unavailable, trying next");
                }
                FailureKind::Unknown => {
                    warn!(
                        worker,
                        status = ?failure.status,
                        error = %failure.message,
                        "Worker failed, trying next"
                    );
                }
            }

            last_error = Some(format!("worker {}: {}", worker, failure.message));
        }

        Err(DispatchError::AllWorkersExhausted {
            tried: count,
            last_error: last_error.unwrap_or_else(|| "no workers configured".to_string()),
        })
    }
}
