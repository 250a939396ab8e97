//! Shared fakes for driving a service client without real processes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use tsunagi::client::ClientNotification;
use tsunagi::config::ClientConfiguration;
use tsunagi::error::ClientResult;
use tsunagi::protocol::{Request, RequestSeq, ServerMessage};
use tsunagi::server::SpawnedServer;
use tsunagi::server::canceller::NoopRequestCanceller;
use tsunagi::server::engine::ProcessServer;
use tsunagi::server::process::ServerProcess;
use tsunagi::server::spawner::{ServerKind, Spawner};
use tsunagi::version::ProtocolVersion;

/// In-memory stand-in for a child process. Writes are recorded and forwarded
/// to the spawner's responder task; kill behaves like SIGKILL, reporting an
/// exit with no code.
struct FakeProcess {
    written: Arc<Mutex<Vec<Request>>>,
    outgoing: mpsc::UnboundedSender<Request>,
    kill_signal: mpsc::UnboundedSender<()>,
    killed: Arc<AtomicBool>,
}

impl ServerProcess for FakeProcess {
    fn write(&self, request: &Request) -> std::io::Result<()> {
        self.written.lock().unwrap().push(request.clone());
        let _ = self.outgoing.send(request.clone());
        Ok(())
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.kill_signal.send(());
    }
}

/// Handle to one fake server a [`FakeSpawner`] created.
pub struct FakeServerHandle {
    pub kind: ServerKind,
    pub engine: Arc<ProcessServer>,
    written: Arc<Mutex<Vec<Request>>>,
    killed: Arc<AtomicBool>,
}

impl FakeServerHandle {
    pub fn commands(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.written.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn respond_success(&self, request_seq: RequestSeq, command: &str, body: Value) {
        self.engine
            .dispatch_message(response_message(request_seq, command, true, None, body));
    }

    pub fn send_event(&self, event: &str, body: Value) {
        self.engine.dispatch_message(
            serde_json::from_value(json!({
                "seq": 0,
                "type": "event",
                "event": event,
                "body": body,
            }))
            .unwrap(),
        );
    }

    /// Simulate an unplanned process crash.
    pub fn crash(&self, code: i32) {
        self.engine.handle_exit(Some(code));
    }

    /// Poll until the fake process has seen `command`, returning the request.
    pub async fn wait_for_command(&self, command: &str) -> Request {
        for _ in 0..200 {
            if let Some(request) = self
                .written
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.command == command)
            {
                return request.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for '{}'; saw {:?}",
            command,
            self.commands()
        );
    }
}

/// Spawner producing fake in-memory servers.
///
/// With `auto_respond` every written request gets an immediate success
/// response; without it the test scripts responses through the handles.
pub struct FakeSpawner {
    auto_respond: bool,
    handles: Mutex<Vec<Arc<FakeServerHandle>>>,
}

impl FakeSpawner {
    pub fn new(auto_respond: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_respond,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeServerHandle> {
        self.handles.lock().unwrap()[index].clone()
    }

    pub fn handle_of_kind(&self, kind: ServerKind) -> Arc<FakeServerHandle> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.kind == kind)
            .cloned()
            .unwrap_or_else(|| panic!("no spawned server of kind {:?}", kind))
    }
}

impl Spawner for FakeSpawner {
    fn spawn(
        &self,
        kind: ServerKind,
        _config: &ClientConfiguration,
        version: ProtocolVersion,
    ) -> ClientResult<SpawnedServer> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let killed = Arc::new(AtomicBool::new(false));
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        let process = FakeProcess {
            written: written.clone(),
            outgoing: outgoing_tx,
            kill_signal: kill_tx,
            killed: killed.clone(),
        };
        let (engine, notices) = ProcessServer::new(
            kind.id(),
            version,
            Arc::new(process),
            Arc::new(NoopRequestCanceller),
        );

        {
            let engine = engine.clone();
            tokio::spawn(async move {
                if kill_rx.recv().await.is_some() {
                    engine.handle_exit(None);
                }
            });
        }
        if self.auto_respond {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(request) = outgoing_rx.recv().await {
                    engine.dispatch_message(response_message(
                        request.seq,
                        &request.command,
                        true,
                        None,
                        json!({}),
                    ));
                }
            });
        }

        let handle = Arc::new(FakeServerHandle {
            kind,
            engine: engine.clone(),
            written,
            killed,
        });
        self.handles.lock().unwrap().push(handle);
        Ok(SpawnedServer { server: engine, notices })
    }
}

pub fn response_message(
    request_seq: RequestSeq,
    command: &str,
    success: bool,
    message: Option<&str>,
    body: Value,
) -> ServerMessage {
    serde_json::from_value(json!({
        "seq": 0,
        "type": "response",
        "command": command,
        "request_seq": request_seq,
        "success": success,
        "message": message,
        "body": body,
    }))
    .unwrap()
}

/// Configuration that spawns exactly one main process.
pub fn single_process_config() -> ClientConfiguration {
    ClientConfiguration {
        use_separate_syntax_server: false,
        ..ClientConfiguration::default()
    }
}

pub async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Receive the next notification, failing the test on a stalled channel.
pub async fn next_notification(
    rx: &mut mpsc::UnboundedReceiver<ClientNotification>,
) -> ClientNotification {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}
