//! Scripted in-process transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::transport::{Outcome, WorkerCall, WorkerFailure, WorkerTransport};
use crate::error::WorkerError;

/// Transport that replays queued outcomes per worker and records every call.
///
/// Workers without queued outcomes fall back to their sticky default, then to
/// `{"ok": true}`.
pub(crate) struct ScriptedTransport {
    count: usize,
    queued: Mutex<HashMap<usize, VecDeque<Outcome>>>,
    defaults: Mutex<HashMap<usize, Outcome>>,
    delays: Mutex<HashMap<usize, Duration>>,
    calls: Mutex<Vec<WorkerCall>>,
}

impl ScriptedTransport {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count,
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues one outcome for the next call to `worker`.
    pub(crate) fn push(&self, worker: usize, outcome: Outcome) {
        self.queued
            .lock()
            .unwrap()
            .entry(worker)
            .or_default()
            .push_back(outcome);
    }

    /// Sets the outcome returned once the queue for `worker` is drained.
    pub(crate) fn set_default(&self, worker: usize, outcome: Outcome) {
        self.defaults.lock().unwrap().insert(worker, outcome);
    }

    /// Delays every answer from `worker`; past the call timeout it times out.
    pub(crate) fn set_delay(&self, worker: usize, delay: Duration) {
        self.delays.lock().unwrap().insert(worker, delay);
    }

    pub(crate) fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn workers_called(&self) -> Vec<usize> {
        self.calls().iter().map(|c| c.worker).collect()
    }

    fn next_outcome(&self, worker: usize) -> Outcome {
        if let Some(outcome) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&worker)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&worker)
            .cloned()
            .unwrap_or_else(|| Outcome::Ok(json!({"ok": true})))
    }
}

#[async_trait]
impl WorkerTransport for ScriptedTransport {
    fn worker_count(&self) -> usize {
        self.count
    }

    async fn call(&self, call: WorkerCall) -> Result<Outcome, WorkerError> {
        if !(1..=self.count).contains(&call.worker) {
            return Err(WorkerError::InvalidWorkerIndex {
                index: call.worker,
                count: self.count,
            });
        }
        self.calls.lock().unwrap().push(call.clone());

        let delay = self.delays.lock().unwrap().get(&call.worker).copied();
        if let Some(delay) = delay {
            if delay >= call.timeout {
                tokio::time::sleep(call.timeout).await;
                return Ok(Outcome::Fail(WorkerFailure::transport(format!(
                    "Timed out after {}ms",
                    call.timeout.as_millis()
                ))));
            }
            tokio::time::sleep(delay).await;
        }

        Ok(self.next_outcome(call.worker))
    }
}

/// `{ok, result: {json, raw_text?}}` success body.
pub(crate) fn search_ok(json_text: &str, raw_text: Option<&str>) -> Outcome {
    let mut result = json!({ "json": json_text });
    if let Some(raw) = raw_text {
        result["raw_text"] = Value::String(raw.to_string());
    }
    Outcome::Ok(json!({ "ok": true, "result": result }))
}

/// HTTP failure with a JSON payload, classified like the real transport does.
pub(crate) fn http_fail(status: u16, payload: Value) -> Outcome {
    let detail = payload
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("error")
        .to_string();
    Outcome::Fail(WorkerFailure::new(
        format!("HTTP {}: {}", status, detail),
        Some(status),
        Some(payload),
    ))
}

pub(crate) fn busy() -> Outcome {
    http_fail(423, json!({"error": "Locked"}))
}

pub(crate) fn warming_up() -> Outcome {
    http_fail(503, json!({"error": "warming_up"}))
}

pub(crate) fn blocked() -> Outcome {
    http_fail(
        503,
        json!({"retry_other_worker": true, "error": "Upstream blocked the session"}),
    )
}

pub(crate) fn empty_result(raw_text: &str) -> Outcome {
    http_fail(422, json!({"error": "empty_result", "raw_text": raw_text}))
}

pub(crate) fn unknown(message: &str) -> Outcome {
    Outcome::Fail(WorkerFailure::transport(message))
}
