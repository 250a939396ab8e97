//! Wire-level data model for the analysis server protocol.
//!
//! The analysis server speaks a simple stdio protocol: each outgoing request is
//! one JSON object terminated by `\r\n`; each incoming message is a
//! `Content-Length`-framed JSON object tagged with a `type` field. The closed
//! set of incoming shapes is modeled as [`ServerMessage`] so dispatch is plain
//! pattern matching rather than open-ended type inspection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Sequence number of a request, unique per server process lifetime.
pub type RequestSeq = u32;

/// An outgoing request: `{ seq, type: "request", command, arguments }`.
///
/// Sequence numbers are assigned by the request queue, monotonically
/// increasing, and never reused within one process's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub seq: RequestSeq,
    pub command: String,
    pub arguments: Value,
}

/// A response frame tied to an earlier request by `request_seq`.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: RequestSeq,
    pub command: String,
    pub request_seq: RequestSeq,
    pub success: bool,
    /// Error text when `success` is false. May be multi-line: a message
    /// followed by a server-side stack trace.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// An unsolicited event frame, not tied to any sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Event {
    /// For a `requestCompleted` event, the sequence number of the async
    /// request it completes.
    pub fn completed_request_seq(&self) -> Option<RequestSeq> {
        self.body
            .as_ref()
            .and_then(|body| body.get("request_seq"))
            .and_then(Value::as_u64)
            .map(|seq| seq as RequestSeq)
    }
}

/// Every message the server can write to its stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Response(Response),
    Event(Event),
}

/// Event name signalling completion of an async request.
pub const EVENT_REQUEST_COMPLETED: &str = "requestCompleted";

/// Kind of a diagnostics event reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticsKind {
    Syntax,
    Semantic,
    Suggestion,
}

impl DiagnosticsKind {
    /// Map a diagnostic event name to its kind. Returns `None` for
    /// non-diagnostic events.
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "syntaxDiag" => Some(DiagnosticsKind::Syntax),
            "semanticDiag" => Some(DiagnosticsKind::Semantic),
            "suggestionDiag" => Some(DiagnosticsKind::Suggestion),
            _ => None,
        }
    }
}

/// A merged diagnostics report surfaced to the embedding application.
///
/// Not persisted beyond the latest value per resource; the embedder owns any
/// longer-lived diagnostics store.
#[derive(Debug, Clone)]
pub struct DiagnosticsEvent {
    pub kind: DiagnosticsKind,
    pub resource: Url,
    pub diagnostics: Vec<Value>,
}
