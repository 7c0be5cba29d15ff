//! Typed worker operations on top of a [`WorkerTransport`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::transport::{Outcome, WorkerCall, WorkerFailure, WorkerRoute, WorkerTransport};
use crate::config::WorkerTimeouts;
use crate::error::WorkerError;

/// Successful `POST /search` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Extracted JSON document, as text. May be empty.
    pub json: String,
    /// Unprocessed page text captured alongside the JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

/// Result of a search call.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchReply {
    /// The worker answered with a well-formed result.
    Found(SearchResult),
    /// The call failed or the body was not a search result.
    Failed(WorkerFailure),
}

/// Wire shape of the search response: `{ok, result: {json, raw_text?}}`.
#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default = "default_true")]
    ok: bool,
    result: Option<SearchEnvelopeResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelopeResult {
    #[serde(default)]
    json: Value,
    #[serde(default)]
    raw_text: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Worker operations with the configured per-route timeouts applied.
#[derive(Clone)]
pub struct WorkerClient {
    transport: Arc<dyn WorkerTransport>,
    timeouts: WorkerTimeouts,
}

impl WorkerClient {
    /// Creates a client over the given transport.
    pub fn new(transport: Arc<dyn WorkerTransport>, timeouts: WorkerTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    /// Number of addressable workers.
    pub fn worker_count(&self) -> usize {
        self.transport.worker_count()
    }

    /// Configured timeouts.
    pub fn timeouts(&self) -> &WorkerTimeouts {
        &self.timeouts
    }

    /// `POST /search {prompt}` on one worker.
    pub async fn search(&self, worker: usize, prompt: &str) -> Result<SearchReply, WorkerError> {
        let call = WorkerCall::new(worker, WorkerRoute::Search, self.timeouts.search)
            .with_body(json!({ "prompt": prompt }));

        let reply = match self.transport.call(call).await? {
            Outcome::Ok(body) => parse_search_body(body),
            Outcome::Fail(failure) => SearchReply::Failed(failure),
        };
        Ok(reply)
    }

    /// `GET /health` on one worker; returns the raw outcome.
    pub async fn health(&self, worker: usize) -> Result<Outcome, WorkerError> {
        let call = WorkerCall::new(worker, WorkerRoute::Health, self.timeouts.health);
        self.transport.call(call).await
    }

    /// `POST /session/refresh` on one worker.
    pub async fn refresh_session(&self, worker: usize) -> Result<Outcome, WorkerError> {
        let call = WorkerCall::new(worker, WorkerRoute::SessionRefresh, self.timeouts.refresh);
        self.transport.call(call).await
    }

    /// `POST /browser/restart` on one worker.
    pub async fn restart_browser(&self, worker: usize) -> Result<Outcome, WorkerError> {
        let call = WorkerCall::new(worker, WorkerRoute::BrowserRestart, self.timeouts.restart);
        self.transport.call(call).await
    }

    /// `POST /tabs/search` on one worker, warming up a search tab.
    pub async fn open_search_tab(&self, worker: usize) -> Result<Outcome, WorkerError> {
        let call = WorkerCall::new(worker, WorkerRoute::SearchTab, self.timeouts.warmup);
        self.transport.call(call).await
    }
}

/// Interprets a 2xx search body.
fn parse_search_body(body: Value) -> SearchReply {
    let envelope: SearchEnvelope = match serde_json::from_value(body.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            return SearchReply::Failed(WorkerFailure::new(
                format!("Malformed search response: {}", e),
                None,
                Some(body),
            ))
        }
    };

    if !envelope.ok {
        let message = envelope
            .error
            .unwrap_or_else(|| "Worker reported ok=false".to_string());
        return SearchReply::Failed(WorkerFailure::new(message, None, Some(body)));
    }

    match envelope.result {
        Some(result) => SearchReply::Found(SearchResult {
            json: match result.json {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            },
            raw_text: result.raw_text,
        }),
        None => SearchReply::Failed(WorkerFailure::new(
            "Search response has no result",
            None,
            Some(body),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::mock::ScriptedTransport;
    use crate::workers::FailureKind;

    #[test]
    fn test_parse_search_body_string_json() {
        let body = json!({"ok": true, "result": {"json": "{\"a\":1}", "raw_text": "A is 1"}});
        let reply = parse_search_body(body);

        assert_eq!(
            reply,
            SearchReply::Found(SearchResult {
                json: "{\"a\":1}".to_string(),
                raw_text: Some("A is 1".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_search_body_object_json() {
        let body = json!({"ok": true, "result": {"json": {"domain": "x.io"}}});
        match parse_search_body(body) {
            SearchReply::Found(result) => {
                assert_eq!(result.json, "{\"domain\":\"x.io\"}");
                assert!(result.raw_text.is_none());
            }
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_body_missing_result() {
        match parse_search_body(json!({"ok": true})) {
            SearchReply::Failed(failure) => assert_eq!(failure.kind, FailureKind::Unknown),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_body_ok_false_busy() {
        match parse_search_body(json!({"ok": false, "error": "Worker busy"})) {
            SearchReply::Failed(failure) => assert_eq!(failure.kind, FailureKind::Busy),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_sends_prompt_with_search_timeout() {
        let transport = Arc::new(ScriptedTransport::new(1));
        transport.push(1, Outcome::Ok(json!({"ok": true, "result": {"json": "{}"}})));
        let client = WorkerClient::new(transport.clone(), WorkerTimeouts::default());

        let reply = client.search(1, "find pricing").await.unwrap();
        assert!(matches!(reply, SearchReply::Found(_)));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].route, WorkerRoute::Search);
        assert_eq!(calls[0].timeout, WorkerTimeouts::default().search);
        assert_eq!(calls[0].body, Some(json!({"prompt": "find pricing"})));
    }

    #[tokio::test]
    async fn test_admin_routes_use_their_timeouts() {
        let transport = Arc::new(ScriptedTransport::new(2));
        let timeouts = WorkerTimeouts::default();
        let client = WorkerClient::new(transport.clone(), timeouts.clone());

        client.refresh_session(2).await.unwrap();
        client.restart_browser(2).await.unwrap();
        client.open_search_tab(2).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].route, WorkerRoute::SessionRefresh);
        assert_eq!(calls[0].timeout, timeouts.refresh);
        assert_eq!(calls[1].route, WorkerRoute::BrowserRestart);
        assert_eq!(calls[1].timeout, timeouts.restart);
        assert_eq!(calls[2].route, WorkerRoute::SearchTab);
        assert_eq!(calls[2].timeout, timeouts.warmup);
        assert!(calls.iter().all(|c| c.worker == 2));
    }
}
