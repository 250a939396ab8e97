//! Server engines, routing, and process plumbing.
//!
//! The building blocks compose bottom-up: a [`engine::ProcessServer`] drives
//! one child process; a [`router::RequestRouter`] maps commands onto several
//! engines; the [`topology`] module wires routers into the two supported
//! multi-process shapes. All of them expose the same [`LanguageServer`]
//! contract so the service client is topology-agnostic.

pub mod callback_map;
pub mod canceller;
pub mod engine;
pub mod error;
pub mod process;
pub mod request_queue;
pub mod router;
pub mod spawner;
pub mod topology;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Event, Response};

use self::error::ServerError;

/// Outcome of a request that completed without a server-side failure.
#[derive(Debug, Clone)]
pub enum ServerResponse {
    /// Successful response carrying a payload.
    Body(Response),
    /// The server answered "No content available.", which is an empty result
    /// rather than an error.
    NoContent,
    /// An async request acknowledged via the `requestCompleted` event.
    Completed,
    /// The request was cancelled locally before a response was dispatched.
    Cancelled(String),
}

/// What a pending callback eventually resolves to, exactly once.
pub type ServerResult = Result<ServerResponse, ServerError>;

/// Asynchronous handle to a request's eventual result.
///
/// Resolution is guaranteed: the callback table resolves every entry on
/// response, cancellation, or process disposal, so awaiting never hangs on a
/// dropped sender in practice. A dropped sender is still mapped to a
/// `Cancelled` marker rather than a panic.
#[derive(Debug)]
pub struct ResponseFuture(oneshot::Receiver<ServerResult>);

impl ResponseFuture {
    pub(crate) fn new(receiver: oneshot::Receiver<ServerResult>) -> Self {
        Self(receiver)
    }
}

impl Future for ResponseFuture {
    type Output = ServerResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Ok(ServerResponse::Cancelled("response channel closed".to_string()))
            })
        })
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteInfo {
    /// A result is expected; register a pending callback.
    pub expects_result: bool,
    /// Fire-and-forget from the transport's point of view; completion arrives
    /// later via a `requestCompleted` event and does not block the queue.
    pub is_async: bool,
    /// Queue behind normal-priority traffic.
    pub low_priority: bool,
    /// Cooperative cancellation for this request.
    pub token: Option<CancellationToken>,
}

impl ExecuteInfo {
    pub fn query() -> Self {
        Self { expects_result: true, ..Self::default() }
    }

    pub fn fire_and_forget() -> Self {
        Self::default()
    }

    pub fn background() -> Self {
        Self { expects_result: true, is_async: true, ..Self::default() }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// One logical analysis server: a single-process engine or a routing topology.
pub trait LanguageServer: Send + Sync {
    /// Identifier used in logs and error messages ("main", "syntax", ...).
    fn server_id(&self) -> &str;

    /// Issue a command. Returns `None` when no result is expected.
    fn execute_impl(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture>;

    /// Kill the underlying process(es). Outstanding callbacks are resolved by
    /// the exit path, never silently dropped.
    fn kill(&self);
}

/// Lifecycle and event notifications emitted by a server.
#[derive(Debug)]
pub enum ServerNotice {
    /// An unsolicited server event, republished verbatim.
    Event(Event),
    /// The process exited; `None` means a clean exit with no code.
    Exit(Option<i32>),
    /// The process failed outside the request/response cycle (spawn error,
    /// broken stream).
    ProcessError(String),
    /// A malformed frame or stream failure on the reader; not tied to any
    /// request.
    ReaderError(String),
}

/// Sending half of a server's notice stream.
pub type NoticeSender = mpsc::UnboundedSender<ServerNotice>;
/// Receiving half of a server's notice stream.
pub type NoticeReceiver = mpsc::UnboundedReceiver<ServerNotice>;

/// A spawned server plus the stream of its notices.
pub struct SpawnedServer {
    pub server: std::sync::Arc<dyn LanguageServer>,
    pub notices: NoticeReceiver,
}

/// Escalation hook for failures no server can repair locally.
///
/// Implemented by the service client; invoked by the router's divergence
/// detector and by non-recoverable command failures.
pub trait ServerDelegate: Send + Sync {
    fn on_fatal_error(&self, command: &str, error: ServerError);
}
