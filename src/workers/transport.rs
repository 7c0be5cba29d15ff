//! HTTP transport to individual workers.
//!
//! A [`WorkerTransport`] performs exactly one call to one worker under a hard
//! deadline and reports the result as an [`Outcome`] value. Transport errors,
//! non-success statuses and unparseable bodies all become
//! [`Outcome::Fail`]; nothing past this boundary has to deal with
//! `reqwest` errors or raw status codes.
//!
//! Failures are classified into a closed [`FailureKind`] set here, once, so
//! the dispatcher can switch on the tag instead of inspecting messages.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;

use super::registry::WorkerRegistry;
use crate::error::WorkerError;

/// Maximum number of characters of a non-JSON error body kept in messages.
const ERROR_SNIPPET_CHARS: usize = 200;

/// Routes exposed by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRoute {
    /// `GET /health`
    Health,
    /// `POST /search`
    Search,
    /// `POST /session/refresh`
    SessionRefresh,
    /// `POST /browser/restart`
    BrowserRestart,
    /// `POST /tabs/search`
    SearchTab,
}

impl WorkerRoute {
    /// Path appended to the worker's base URL.
    pub fn path(&self) -> &'static str {
        match self {
            WorkerRoute::Health => "/health",
            WorkerRoute::Search => "/search",
            WorkerRoute::SessionRefresh => "/session/refresh",
            WorkerRoute::BrowserRestart => "/browser/restart",
            WorkerRoute::SearchTab => "/tabs/search",
        }
    }

    /// HTTP method used for the route.
    pub fn method(&self) -> Method {
        match self {
            WorkerRoute::Health => Method::GET,
            _ => Method::POST,
        }
    }
}

impl fmt::Display for WorkerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}

/// A single call to a single worker.
#[derive(Debug, Clone)]
pub struct WorkerCall {
    /// 1-based worker index.
    pub worker: usize,
    /// Route to call.
    pub route: WorkerRoute,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Hard deadline for the whole exchange.
    pub timeout: Duration,
    /// Parse the success body as JSON; otherwise it is returned as a string.
    pub expect_json: bool,
}

impl WorkerCall {
    /// Creates a call without body that expects a JSON response.
    pub fn new(worker: usize, route: WorkerRoute, timeout: Duration) -> Self {
        Self {
            worker,
            route,
            body: None,
            timeout,
            expect_json: true,
        }
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the success body as plain text instead of parsing it.
    pub fn expecting_text(mut self) -> Self {
        self.expect_json = false;
        self
    }
}

/// Closed classification of worker failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The worker is handling another request.
    Busy,
    /// The worker is still starting its browser session.
    WarmingUp,
    /// The upstream site flagged the request; other workers will not fare better.
    Blocked,
    /// The search legitimately found nothing; the payload carries `raw_text`.
    EmptyResult,
    /// Anything else: timeouts, connection errors, unexpected statuses.
    Unknown,
}

impl FailureKind {
    /// Classifies a failure from its status, structured payload and message.
    pub fn classify(status: Option<u16>, payload: Option<&Value>, message: &str) -> Self {
        let error_field = payload
            .and_then(|p| p.get("error"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if status == Some(422) && error_field == "empty_result" {
            return FailureKind::EmptyResult;
        }

        let retry_other = payload
            .and_then(|p| p.get("retry_other_worker"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if status == Some(503) && retry_other {
            return FailureKind::Blocked;
        }

        // "Locked" is matched as sent so that "blocked" does not read as busy
        let signals = format!("{} {}", message, error_field);
        let lowered = signals.to_lowercase();
        if status == Some(423) || signals.contains("Locked") || lowered.contains("busy") {
            return FailureKind::Busy;
        }

        if status == Some(503) && lowered.contains("warming_up") {
            return FailureKind::WarmingUp;
        }

        FailureKind::Unknown
    }

    /// Busy and warming-up workers may be skipped without counting as an error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, FailureKind::Busy | FailureKind::WarmingUp)
    }

    /// Stable lowercase label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Busy => "busy",
            FailureKind::WarmingUp => "warming_up",
            FailureKind::Blocked => "blocked",
            FailureKind::EmptyResult => "empty_result",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed worker call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    /// Human-readable description.
    pub message: String,
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Structured error body, if the response body was JSON.
    pub payload: Option<Value>,
    /// Classification decided at construction.
    pub kind: FailureKind,
}

impl WorkerFailure {
    /// Creates a failure and classifies it.
    pub fn new(message: impl Into<String>, status: Option<u16>, payload: Option<Value>) -> Self {
        let message = message.into();
        let kind = FailureKind::classify(status, payload.as_ref(), &message);
        Self {
            message,
            status,
            payload,
            kind,
        }
    }

    /// Creates a failure for a request that never produced a response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(message, None, None)
    }

    /// `raw_text` carried by the error payload, if any.
    pub fn raw_text(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("raw_text"))
            .and_then(Value::as_str)
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Normalized result of a worker call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx response; the parsed JSON body, or the text body as a string.
    Ok(Value),
    /// Any failure, classified.
    Fail(WorkerFailure),
}

impl Outcome {
    /// Returns whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> Result<Value, WorkerFailure> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Fail(failure) => Err(failure),
        }
    }
}

/// Performs single calls to workers.
///
/// Implementations must never block past `call.timeout` and must report every
/// failure other than an unknown worker index as [`Outcome::Fail`].
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Number of addressable workers.
    fn worker_count(&self) -> usize;

    /// Executes one call.
    async fn call(&self, call: WorkerCall) -> Result<Outcome, WorkerError>;
}

/// `reqwest`-backed transport resolving workers through a [`WorkerRegistry`].
pub struct HttpTransport {
    client: Client,
    registry: Arc<WorkerRegistry>,
}

impl HttpTransport {
    /// Creates a transport with a default HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ClientInit` if the HTTP client cannot be built.
    pub fn new(registry: Arc<WorkerRegistry>) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .build()
            .map_err(|e| WorkerError::ClientInit(e.to_string()))?;
        Ok(Self::with_client(registry, client))
    }

    /// Creates a transport sharing an existing HTTP client.
    pub fn with_client(registry: Arc<WorkerRegistry>, client: Client) -> Self {
        Self { client, registry }
    }

    /// The registry this transport resolves workers against.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Sends the request and reads the body. No deadline is applied here.
    async fn exchange(&self, url: &str, call: &WorkerCall) -> Outcome {
        let mut request = self.client.request(call.route.method(), url);
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Outcome::Fail(WorkerFailure::transport(format!("Request failed: {}", e))),
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Outcome::Fail(WorkerFailure::new(
                    format!("Failed to read response body: {}", e),
                    Some(status),
                    None,
                ))
            }
        };

        if !(200..300).contains(&status) {
            // Error bodies often carry raw_text or retry hints worth keeping
            let failure = match serde_json::from_str::<Value>(&text) {
                Ok(payload) => WorkerFailure::new(
                    format!("HTTP {}: {}", status, error_detail(&payload)),
                    Some(status),
                    Some(payload),
                ),
                Err(_) => WorkerFailure::new(
                    format!("HTTP {}: {}", status, snippet(&text)),
                    Some(status),
                    None,
                ),
            };
            return Outcome::Fail(failure);
        }

        if !call.expect_json {
            return Outcome::Ok(Value::String(text));
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Fail(WorkerFailure::new(
                format!("Invalid JSON from worker: {} (body: {})", e, snippet(&text)),
                Some(status),
                None,
            )),
        }
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    fn worker_count(&self) -> usize {
        self.registry.len()
    }

    async fn call(&self, call: WorkerCall) -> Result<Outcome, WorkerError> {
        let base = self.registry.endpoint(call.worker)?;
        let url = format!("{}{}", base, call.route.path());

        let outcome = match tokio::time::timeout(call.timeout, self.exchange(&url, &call)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Fail(WorkerFailure::transport(format!(
                "Timed out after {}ms",
                call.timeout.as_millis()
            ))),
        };

        if let Outcome::Fail(failure) = &outcome {
            debug!(
                worker = call.worker,
                route = %call.route,
                status = ?failure.status,
                kind = %failure.kind,
                error = %failure.message,
                "Worker call failed"
            );
        }

        Ok(outcome)
    }
}

/// Short description of a structured error body.
fn error_detail(payload: &Value) -> String {
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| snippet(&payload.to_string()))
}

/// Truncates text to [`ERROR_SNIPPET_CHARS`] characters.
fn snippet(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(ERROR_SNIPPET_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_paths_and_methods() {
        assert_eq!(WorkerRoute::Health.path(), "/health");
        assert_eq!(WorkerRoute::Health.method(), Method::GET);
        assert_eq!(WorkerRoute::Search.method(), Method::POST);
        assert_eq!(WorkerRoute::SearchTab.path(), "/tabs/search");
        assert_eq!(WorkerRoute::SessionRefresh.to_string(), "POST /session/refresh");
    }

    #[test]
    fn test_classify_empty_result() {
        let payload = json!({"error": "empty_result", "raw_text": "nothing here"});
        let failure = WorkerFailure::new("HTTP 422: empty_result", Some(422), Some(payload));

        assert_eq!(failure.kind, FailureKind::EmptyResult);
        assert_eq!(failure.raw_text(), Some("nothing here"));
    }

    #[test]
    fn test_classify_empty_result_requires_422() {
        let payload = json!({"error": "empty_result"});
        let kind = FailureKind::classify(Some(500), Some(&payload), "HTTP 500");
        assert_eq!(kind, FailureKind::Unknown);
    }

    #[test]
    fn test_classify_blocked() {
        let payload = json!({"retry_other_worker": true, "error": "captcha detected"});
        let kind = FailureKind::classify(Some(503), Some(&payload), "HTTP 503: captcha detected");
        assert_eq!(kind, FailureKind::Blocked);
    }

    #[test]
    fn test_classify_busy() {
        assert_eq!(
            FailureKind::classify(Some(423), None, "HTTP 423"),
            FailureKind::Busy
        );
        assert_eq!(
            FailureKind::classify(Some(409), None, "Worker is busy"),
            FailureKind::Busy
        );
        assert_eq!(
            FailureKind::classify(None, None, "Resource Locked"),
            FailureKind::Busy
        );
        let payload = json!({"error": "busy"});
        assert_eq!(
            FailureKind::classify(Some(429), Some(&payload), "HTTP 429"),
            FailureKind::Busy
        );
    }

    #[test]
    fn test_classify_blocked_text_is_not_busy() {
        assert_eq!(
            FailureKind::classify(Some(500), None, "HTTP 500: request blocked"),
            FailureKind::Unknown
        );
        let payload = json!({"error": "Request was blocked by upstream"});
        assert_eq!(
            FailureKind::classify(Some(502), Some(&payload), "HTTP 502"),
            FailureKind::Unknown
        );
    }

    #[test]
    fn test_classify_warming_up() {
        let payload = json!({"error": "warming_up"});
        let kind = FailureKind::classify(Some(503), Some(&payload), "HTTP 503: warming_up");
        assert_eq!(kind, FailureKind::WarmingUp);
        assert!(kind.is_unavailable());
    }

    #[test]
    fn test_classify_unknown() {
        let kind = FailureKind::classify(None, None, "Timed out after 100ms");
        assert_eq!(kind, FailureKind::Unknown);
        assert!(!kind.is_unavailable());

        let payload = json!({"error": "internal"});
        let kind = FailureKind::classify(Some(503), Some(&payload), "HTTP 503: internal");
        assert_eq!(kind, FailureKind::Unknown);
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = Outcome::Ok(json!({"ok": true}));
        assert!(ok.is_ok());
        assert_eq!(ok.into_result().unwrap(), json!({"ok": true}));

        let failed = Outcome::Fail(WorkerFailure::transport("connection refused"));
        assert!(!failed.is_ok());
        assert_eq!(failed.into_result().unwrap_err().kind, FailureKind::Unknown);
    }

    #[test]
    fn test_error_detail_prefers_error_field() {
        assert_eq!(error_detail(&json!({"error": "boom", "message": "x"})), "boom");
        assert_eq!(error_detail(&json!({"detail": "gone"})), "gone");
        assert_eq!(error_detail(&json!({"code": 7})), "{\"code\":7}");
    }

    #[test]
    fn test_snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        let cut = snippet(&long);
        assert_eq!(cut.len(), ERROR_SNIPPET_CHARS + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(snippet("short"), "short");
    }

    #[tokio::test]
    async fn test_http_transport_rejects_unknown_worker() {
        let registry = Arc::new(WorkerRegistry::from_urls(["http://127.0.0.1:9"]).unwrap());
        let transport = HttpTransport::new(registry).unwrap();

        let call = WorkerCall::new(2, WorkerRoute::Health, Duration::from_millis(50));
        let result = transport.call(call).await;

        assert!(matches!(
            result,
            Err(WorkerError::InvalidWorkerIndex { index: 2, count: 1 })
        ));
    }
}
