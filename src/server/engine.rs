//! Single-process server engine.
//!
//! [`ProcessServer`] owns exactly one child process and enforces the dispatch
//! rule of the protocol: at most one response-expecting, non-async request is
//! on the wire at a time. Async requests bypass that rule and are completed
//! by `requestCompleted` events, so long-running work never blocks the
//! interactive queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::AsyncBufRead;

use crate::error::LockRecoverExt;
use crate::protocol::{EVENT_REQUEST_COMPLETED, RequestSeq, Response, ServerMessage};
use crate::version::ProtocolVersion;
use crate::wire;

use super::callback_map::CallbackMap;
use super::canceller::OngoingRequestCanceller;
use super::error::ServerError;
use super::process::ServerProcess;
use super::request_queue::{RequestItem, RequestQueue, RequestQueueingKind};
use super::{
    ExecuteInfo, LanguageServer, NoticeReceiver, NoticeSender, ResponseFuture, ServerNotice,
    ServerResponse,
};

/// Commands that mutate shared buffer state and must keep their queue
/// position relative to everything queued before them.
const FENCE_COMMANDS: &[&str] = &["change", "close", "open", "updateOpen"];

/// The server reports an empty (but not failed) result with this message.
const NO_CONTENT: &str = "No content available.";

fn queueing_kind(command: &str, low_priority: bool) -> RequestQueueingKind {
    if FENCE_COMMANDS.contains(&command) {
        RequestQueueingKind::Fence
    } else if low_priority {
        RequestQueueingKind::LowPriority
    } else {
        RequestQueueingKind::Normal
    }
}

#[derive(Default)]
struct EngineState {
    queue: RequestQueue,
    /// Sequence numbers written to the wire whose responses gate further
    /// sends. Async requests never enter this set.
    pending_responses: HashSet<RequestSeq>,
    disposed: bool,
}

/// Engine for one child process.
pub struct ProcessServer {
    server_id: String,
    version: ProtocolVersion,
    process: Arc<dyn ServerProcess>,
    canceller: Arc<dyn OngoingRequestCanceller>,
    callbacks: CallbackMap,
    state: Mutex<EngineState>,
    notices: NoticeSender,
    /// Self-handle for spawned cancellation watchers; set by `new`.
    weak_self: std::sync::Weak<Self>,
}

impl ProcessServer {
    pub fn new(
        server_id: impl Into<String>,
        version: ProtocolVersion,
        process: Arc<dyn ServerProcess>,
        canceller: Arc<dyn OngoingRequestCanceller>,
    ) -> (Arc<Self>, NoticeReceiver) {
        let (notices, notice_rx) = tokio::sync::mpsc::unbounded_channel();
        let server = Arc::new_cyclic(|weak| Self {
            server_id: server_id.into(),
            version,
            process,
            canceller,
            callbacks: CallbackMap::new(),
            state: Mutex::new(EngineState::default()),
            notices,
            weak_self: weak.clone(),
        });
        (server, notice_rx)
    }

    /// Handle one decoded message from the process's stdout.
    pub fn dispatch_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response(response) => self.dispatch_response(response),
            ServerMessage::Event(event) => {
                if event.event == EVENT_REQUEST_COMPLETED {
                    // Completion of an async request; consumed here, never
                    // republished.
                    if let Some(seq) = event.completed_request_seq() {
                        if let Some(callback) = self.callbacks.fetch(seq) {
                            callback.resolve(Ok(ServerResponse::Completed));
                        }
                    }
                } else {
                    let _ = self.notices.send(ServerNotice::Event(event));
                }
            }
        }
        let mut state = self.state.lock().recover_poisoned("dispatch_message");
        self.send_next_requests(&mut state);
    }

    fn dispatch_response(&self, response: Response) {
        let removed = {
            let mut state = self.state.lock().recover_poisoned("dispatch_response");
            state.pending_responses.remove(&response.request_seq)
        };
        let Some(callback) = self.callbacks.fetch(response.request_seq) else {
            // Cancelled locally, or a frame for a sequence number we never
            // issued. Either way there is nothing to resolve.
            log::trace!(
                target: "tsunagi::engine",
                "<{}> response for unknown request {} ({}); dropped (pending: {})",
                self.server_id,
                response.request_seq,
                response.command,
                removed
            );
            return;
        };
        log::trace!(
            target: "tsunagi::engine",
            "<{}> response for {} ({}) after {:?}",
            self.server_id,
            response.request_seq,
            response.command,
            callback.queuing_start.elapsed()
        );
        if response.success {
            callback.resolve(Ok(ServerResponse::Body(response)));
        } else if response.message.as_deref() == Some(NO_CONTENT) {
            // Empty result, not a failure.
            callback.resolve(Ok(ServerResponse::NoContent));
        } else {
            callback.resolve(Err(ServerError::from_response(
                &self.server_id,
                self.version,
                &response,
            )));
        }
    }

    /// Drain the queue until a response-gating request is outstanding.
    fn send_next_requests(&self, state: &mut EngineState) {
        while state.pending_responses.is_empty() {
            let Some(item) = state.queue.dequeue() else {
                break;
            };
            self.send_request(state, item);
        }
    }

    fn send_request(&self, state: &mut EngineState, item: RequestItem) {
        let seq = item.request.seq;
        if item.expects_response && !item.is_async {
            state.pending_responses.insert(seq);
        }
        if let Err(e) = self.process.write(&item.request) {
            log::warn!(
                target: "tsunagi::engine",
                "<{}> failed to write request {} ({}): {}",
                self.server_id,
                seq,
                item.request.command,
                e
            );
            state.pending_responses.remove(&seq);
            if let Some(callback) = self.callbacks.fetch(seq) {
                callback.resolve(Err(ServerError::Write {
                    server_id: self.server_id.clone(),
                    command: item.request.command,
                    message: e.to_string(),
                }));
            }
        }
    }

    /// Best-effort cancellation.
    ///
    /// A still-queued request is removed for free. A request already on the
    /// wire is signalled through the out-of-band canceller. In both cases the
    /// local callback resolves to `Cancelled` immediately; any late response
    /// from the server finds no callback and is dropped.
    pub fn try_cancel_request(&self, seq: RequestSeq, command: &str) -> bool {
        let cancelled = {
            let mut state = self.state.lock().recover_poisoned("try_cancel_request");
            if state.queue.try_delete(seq) {
                log::trace!(
                    target: "tsunagi::engine",
                    "<{}> cancelled queued request {} ({})",
                    self.server_id,
                    seq,
                    command
                );
                true
            } else if self.canceller.try_cancel_ongoing_request(seq) {
                state.pending_responses.remove(&seq);
                true
            } else {
                log::trace!(
                    target: "tsunagi::engine",
                    "<{}> could not cancel request {} ({}); already delivered",
                    self.server_id,
                    seq,
                    command
                );
                state.pending_responses.remove(&seq);
                false
            }
        };
        // The local result is authoritative regardless of whether the server
        // saw the signal.
        if let Some(callback) = self.callbacks.fetch(seq) {
            callback.resolve(Ok(ServerResponse::Cancelled(format!(
                "Cancelled request {} - {}",
                seq, command
            ))));
        }
        let mut state = self.state.lock().recover_poisoned("try_cancel_request");
        self.send_next_requests(&mut state);
        cancelled
    }

    /// React to process termination: fail everything outstanding and notify.
    pub fn handle_exit(&self, code: Option<i32>) {
        let already_disposed = {
            let mut state = self.state.lock().recover_poisoned("handle_exit");
            let already = state.disposed;
            state.disposed = true;
            state.queue = RequestQueue::default();
            state.pending_responses.clear();
            already
        };
        self.callbacks.destroy(&self.server_id, "server exited");
        if !already_disposed {
            log::info!(
                target: "tsunagi::engine",
                "<{}> server exited with code {:?}",
                self.server_id,
                code
            );
            let _ = self.notices.send(ServerNotice::Exit(code));
        }
    }

    /// Report a failure outside the request/response cycle.
    pub fn handle_process_error(&self, message: String) {
        let _ = self.notices.send(ServerNotice::ProcessError(message));
    }
}

impl LanguageServer for ProcessServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn execute_impl(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture> {
        let mut state = self.state.lock().recover_poisoned("execute_impl");
        if state.disposed {
            drop(state);
            if !info.expects_result {
                return None;
            }
            let (sender, receiver) = tokio::sync::oneshot::channel();
            let _ = sender.send(Err(ServerError::terminated(&self.server_id, "server exited")));
            return Some(ResponseFuture::new(receiver));
        }

        let request = state.queue.create_request(command, args);
        let seq = request.seq;
        let item = RequestItem {
            request,
            expects_response: info.expects_result,
            is_async: info.is_async,
            queueing_kind: queueing_kind(command, info.low_priority),
        };

        let future = if info.expects_result {
            let receiver = self.callbacks.add(seq, info.is_async);
            Some(ResponseFuture::new(receiver))
        } else {
            None
        };

        state.queue.enqueue(item);
        self.send_next_requests(&mut state);
        drop(state);

        if let Some(token) = info.token {
            let command = command.to_string();
            let server = self.weak_self.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                if let Some(server) = server.upgrade() {
                    server.try_cancel_request(seq, &command);
                }
            });
        }
        future
    }

    fn kill(&self) {
        self.process.kill();
    }
}

/// Reader task: decodes stdout frames and feeds them to the engine.
///
/// A malformed frame is reported and skipped; only EOF or a broken stream
/// ends the loop. Process death is reported by the exit watcher, not here.
pub async fn read_loop<R>(server: Arc<ProcessServer>, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match wire::read_message(&mut reader).await {
            Ok(Some(message)) => server.dispatch_message(message),
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!(
                    target: "tsunagi::engine",
                    "<{}> dropped malformed message: {}",
                    server.server_id,
                    e
                );
                let _ = server
                    .notices
                    .send(ServerNotice::ReaderError(e.to_string()));
            }
            Err(e) => {
                let _ = server
                    .notices
                    .send(ServerNotice::ReaderError(e.to_string()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, Request};
    use serde_json::json;
    use std::io;

    #[derive(Default)]
    struct FakeProcess {
        written: Mutex<Vec<Request>>,
        fail_writes: bool,
    }

    impl FakeProcess {
        fn commands(&self) -> Vec<String> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.command.clone())
                .collect()
        }
    }

    impl ServerProcess for FakeProcess {
        fn write(&self, request: &Request) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.written.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn kill(&self) {}
    }

    fn engine(process: Arc<FakeProcess>) -> (Arc<ProcessServer>, NoticeReceiver) {
        ProcessServer::new(
            "main",
            ProtocolVersion::DEFAULT,
            process,
            Arc::new(super::super::canceller::NoopRequestCanceller),
        )
    }

    fn response(request_seq: RequestSeq, command: &str, success: bool, message: Option<&str>) -> ServerMessage {
        ServerMessage::Response(
            serde_json::from_value(json!({
                "seq": 0,
                "command": command,
                "request_seq": request_seq,
                "success": success,
                "message": message,
                "body": if success { json!({"ok": true}) } else { Value::Null },
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn one_response_expecting_request_on_the_wire_at_a_time() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let first = server.execute_impl("quickinfo", json!({}), ExecuteInfo::query());
        let mut second = tokio_test::task::spawn(
            server
                .execute_impl("references", json!({}), ExecuteInfo::query())
                .unwrap(),
        );
        assert_eq!(process.commands(), vec!["quickinfo"]);
        tokio_test::assert_pending!(second.poll());

        // The first response releases the second request onto the wire but
        // does not resolve it.
        server.dispatch_message(response(0, "quickinfo", true, None));
        assert_eq!(process.commands(), vec!["quickinfo", "references"]);
        tokio_test::assert_pending!(second.poll());

        match first.unwrap().await {
            Ok(ServerResponse::Body(body)) => assert_eq!(body.command, "quickinfo"),
            other => panic!("expected body, got {:?}", other),
        }

        server.dispatch_message(response(1, "references", true, None));
        match tokio_test::assert_ready!(second.poll()) {
            Ok(ServerResponse::Body(body)) => assert_eq!(body.command, "references"),
            other => panic!("expected body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn async_and_fire_and_forget_requests_do_not_block_the_queue() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let geterr = server.execute_impl("geterr", json!({}), ExecuteInfo::background());
        server.execute_impl("configure", json!({}), ExecuteInfo::fire_and_forget());
        let query = server.execute_impl("quickinfo", json!({}), ExecuteInfo::query());

        // All three reach the wire; only the sync query gates further sends.
        assert_eq!(process.commands(), vec!["geterr", "configure", "quickinfo"]);

        server.dispatch_message(ServerMessage::Event(Event {
            event: EVENT_REQUEST_COMPLETED.to_string(),
            body: Some(json!({"request_seq": 0})),
        }));
        assert!(matches!(geterr.unwrap().await, Ok(ServerResponse::Completed)));

        server.dispatch_message(response(2, "quickinfo", true, None));
        assert!(matches!(query.unwrap().await, Ok(ServerResponse::Body(_))));
    }

    #[tokio::test]
    async fn no_content_failure_resolves_as_empty_result() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let future = server
            .execute_impl("definition", json!({}), ExecuteInfo::query())
            .unwrap();
        server.dispatch_message(response(0, "definition", false, Some("No content available.")));
        assert!(matches!(future.await, Ok(ServerResponse::NoContent)));
    }

    #[tokio::test]
    async fn failure_response_resolves_with_structured_error() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let future = server
            .execute_impl("rename", json!({}), ExecuteInfo::query())
            .unwrap();
        server.dispatch_message(response(0, "rename", false, Some("boom")));
        match future.await {
            Err(ServerError::Response { command, .. }) => assert_eq!(command, "rename"),
            other => panic!("expected response error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelling_a_queued_request_frees_it_without_touching_the_wire() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let _gate = server.execute_impl("quickinfo", json!({}), ExecuteInfo::query());
        let queued = server
            .execute_impl("references", json!({}), ExecuteInfo::query())
            .unwrap();

        assert!(server.try_cancel_request(1, "references"));
        match queued.await {
            Ok(ServerResponse::Cancelled(reason)) => assert!(reason.contains("references")),
            other => panic!("expected cancellation, got {:?}", other),
        }
        // The cancelled request never reaches the wire.
        assert_eq!(process.commands(), vec!["quickinfo"]);
    }

    #[tokio::test]
    async fn late_response_after_inflight_cancellation_is_dropped() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        let inflight = server
            .execute_impl("references", json!({}), ExecuteInfo::query())
            .unwrap();
        let _queued = server.execute_impl("quickinfo", json!({}), ExecuteInfo::query());

        // Already on the wire: the noop canceller cannot reach it, but the
        // local callback still resolves and the queue unblocks.
        assert!(!server.try_cancel_request(0, "references"));
        assert!(matches!(
            inflight.await,
            Ok(ServerResponse::Cancelled(_))
        ));
        assert_eq!(process.commands(), vec!["references", "quickinfo"]);

        // The server's answer eventually arrives; nobody is waiting for it.
        server.dispatch_message(response(0, "references", true, None));
        assert_eq!(process.commands(), vec!["references", "quickinfo"]);
    }

    #[tokio::test]
    async fn exit_fails_all_outstanding_requests() {
        let process = Arc::new(FakeProcess::default());
        let (server, mut notices) = engine(process.clone());

        let inflight = server
            .execute_impl("quickinfo", json!({}), ExecuteInfo::query())
            .unwrap();
        let queued = server
            .execute_impl("references", json!({}), ExecuteInfo::query())
            .unwrap();

        server.handle_exit(Some(1));
        for future in [inflight, queued] {
            assert!(matches!(future.await, Err(ServerError::Terminated { .. })));
        }
        assert!(matches!(notices.try_recv(), Ok(ServerNotice::Exit(Some(1)))));

        // Requests after disposal fail immediately.
        let late = server
            .execute_impl("quickinfo", json!({}), ExecuteInfo::query())
            .unwrap();
        assert!(matches!(late.await, Err(ServerError::Terminated { .. })));
    }

    #[tokio::test]
    async fn process_errors_are_reported_without_ending_the_engine() {
        let process = Arc::new(FakeProcess::default());
        let (server, mut notices) = engine(process.clone());

        server.handle_process_error("waiting on the server process failed".to_string());
        assert!(matches!(
            notices.try_recv(),
            Ok(ServerNotice::ProcessError(message)) if message.contains("failed")
        ));

        // The engine is not disposed by a process error alone.
        let future = server
            .execute_impl("quickinfo", json!({}), ExecuteInfo::query())
            .unwrap();
        server.dispatch_message(response(0, "quickinfo", true, None));
        assert!(matches!(future.await, Ok(ServerResponse::Body(_))));
    }

    #[tokio::test]
    async fn write_failure_resolves_the_callback_and_unblocks_the_queue() {
        let process = Arc::new(FakeProcess {
            fail_writes: true,
            ..FakeProcess::default()
        });
        let (server, _notices) = engine(process.clone());

        let first = server
            .execute_impl("quickinfo", json!({}), ExecuteInfo::query())
            .unwrap();
        match first.await {
            Err(ServerError::Write { command, .. }) => assert_eq!(command, "quickinfo"),
            other => panic!("expected write error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fence_commands_keep_their_position() {
        let process = Arc::new(FakeProcess::default());
        let (server, _notices) = engine(process.clone());

        // Gate the queue so later items stay queued.
        let _gate = server.execute_impl("quickinfo", json!({}), ExecuteInfo::query());
        server.execute_impl(
            "projectInfo",
            json!({}),
            ExecuteInfo { expects_result: true, low_priority: true, ..ExecuteInfo::default() },
        );
        server.execute_impl("change", json!({}), ExecuteInfo::fire_and_forget());
        server.execute_impl("references", json!({}), ExecuteInfo::query());

        // change (fence) holds its place behind projectInfo; references may
        // only pass the low-priority item, not the fence.
        server.dispatch_message(response(0, "quickinfo", true, None));
        assert_eq!(process.commands(), vec!["quickinfo", "projectInfo"]);
        server.dispatch_message(response(1, "projectInfo", true, None));
        assert_eq!(
            process.commands(),
            vec!["quickinfo", "projectInfo", "change", "references"]
        );
    }
}
