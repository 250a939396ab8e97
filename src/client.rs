//! Crash-resilient orchestrator over the server topology.
//!
//! [`ServiceClient`] owns the lifecycle of the logical server: it spawns the
//! topology, republishes its events, and restarts it when a process dies
//! underneath it. Every spawned topology gets a generation number; notice
//! pumps carry the generation they were started with and stop the moment a
//! newer topology exists, so a killed server's dying breath can never
//! restart or fail the client.

pub mod buffer_sync;

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ClientConfiguration;
use crate::error::{ClientError, ClientResult, LockRecoverExt};
use crate::protocol::{DiagnosticsEvent, DiagnosticsKind, Event};
use crate::server::error::ServerError;
use crate::server::spawner::{Spawner, spawn_topology};
use crate::server::{
    ExecuteInfo, LanguageServer, NoticeReceiver, ServerDelegate, ServerNotice, ServerResponse,
};
use crate::version::ProtocolVersion;

use buffer_sync::BufferSync;

/// Crashes faster than this after a start count as start failures.
const IMMEDIATE_CRASH_WINDOW: Duration = Duration::from_secs(10);
/// Repeated crashes inside this window get a loud warning.
const CRASH_STORM_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Unplanned exits tolerated before the windows above are consulted.
const MAX_RESTARTS: u32 = 5;

/// Outward notification stream of the client.
#[derive(Debug)]
pub enum ClientNotification {
    /// A topology is up and serving.
    Started { version: ProtocolVersion },
    /// An unsolicited server event, excluding diagnostics.
    Event(Event),
    /// A diagnostics report for one resource.
    Diagnostics(DiagnosticsEvent),
    /// The topology went down; `restarting` tells whether a replacement is
    /// being started.
    Exited { restarting: bool },
    /// A non-recoverable command failure; the topology was torn down.
    FatalError { command: String, message: String },
    /// The crash-storm threshold was exceeded; the client gave up.
    PermanentlyFailed,
}

/// Per-call options for [`ServiceClient::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteConfig {
    /// Queue behind interactive traffic.
    pub low_priority: bool,
    /// A failure of this request means the server is unusable; escalate
    /// instead of surfacing the error to the caller only.
    pub non_recoverable: bool,
    /// Cancel automatically when this resource's buffer changes or closes.
    pub cancel_on_resource_change: Option<Url>,
    /// Caller-side cancellation.
    pub token: Option<CancellationToken>,
}

enum ServerState {
    NotStarted,
    Running {
        server: Arc<dyn LanguageServer>,
        version: ProtocolVersion,
    },
    Errored {
        message: String,
    },
}

#[derive(Default)]
struct RestartHistory {
    unplanned_exits: u32,
    last_start: Option<Instant>,
    permanently_failed: bool,
}

struct InflightRequest {
    id: u64,
    resource: Url,
    token: CancellationToken,
}

/// Client for one logical analysis service.
pub struct ServiceClient {
    config: ArcSwap<ClientConfiguration>,
    spawner: Arc<dyn Spawner>,
    state: Mutex<ServerState>,
    restarts: Mutex<RestartHistory>,
    /// Bumped on every planned or unplanned topology change. Notice pumps
    /// compare against it before acting.
    generation: AtomicU64,
    inflight: Mutex<Vec<InflightRequest>>,
    next_inflight_id: AtomicU64,
    buffer_sync: BufferSync,
    notifications: mpsc::UnboundedSender<ClientNotification>,
    weak_self: Weak<Self>,
}

impl ServiceClient {
    pub fn new(
        config: ClientConfiguration,
        spawner: Arc<dyn Spawner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientNotification>) {
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let client = Arc::new_cyclic(|weak| Self {
            config: ArcSwap::from_pointee(config),
            spawner,
            state: Mutex::new(ServerState::NotStarted),
            restarts: Mutex::new(RestartHistory::default()),
            generation: AtomicU64::new(0),
            inflight: Mutex::new(Vec::new()),
            next_inflight_id: AtomicU64::new(0),
            buffer_sync: BufferSync::new(),
            notifications,
            weak_self: weak.clone(),
        });
        (client, notification_rx)
    }

    /// Start the service if it is not already running.
    pub fn start(&self) -> ClientResult<()> {
        self.ensure_started().map(|_| ())
    }

    /// Version of the currently running server, if any.
    pub fn server_version(&self) -> Option<ProtocolVersion> {
        match &*self.state.lock().recover_poisoned("server_version") {
            ServerState::Running { version, .. } => Some(*version),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            &*self.state.lock().recover_poisoned("is_running"),
            ServerState::Running { .. }
        )
    }

    /// Planned restart. Resets crash tracking; buffers are replayed into the
    /// new topology.
    pub fn restart(&self) -> ClientResult<()> {
        {
            let mut restarts = self.restarts.lock().recover_poisoned("restart");
            restarts.unplanned_exits = 0;
            restarts.permanently_failed = false;
        }
        self.kill_current_topology("restart");
        self.start_service(true).map(|_| ())
    }

    /// Planned shutdown. The exit this provokes is not treated as a crash.
    pub fn stop(&self) {
        self.kill_current_topology("stop");
    }

    /// Issue a response-expecting request.
    pub async fn execute(
        &self,
        command: &str,
        args: Value,
        config: ExecuteConfig,
    ) -> ClientResult<ServerResponse> {
        let server = self.ensure_started()?;

        let token = match (&config.cancel_on_resource_change, &config.token) {
            (_, Some(token)) => Some(token.clone()),
            (Some(_), None) => Some(CancellationToken::new()),
            (None, None) => None,
        };
        let tracked = match (&config.cancel_on_resource_change, &token) {
            (Some(resource), Some(token)) => {
                Some(self.track_inflight(resource.clone(), token.clone()))
            }
            _ => None,
        };

        let info = ExecuteInfo {
            expects_result: true,
            is_async: false,
            low_priority: config.low_priority,
            token,
        };
        let result = match server.execute_impl(command, args, info) {
            Some(future) => future.await,
            None => Ok(ServerResponse::NoContent),
        };

        if let Some(id) = tracked {
            self.untrack_inflight(id);
        }
        if config.non_recoverable {
            if let Err(err) = &result {
                self.fatal_error(command, err.clone());
            }
        }
        result.map_err(ClientError::from)
    }

    /// Issue an async request; resolves when the server reports completion.
    pub async fn execute_async(&self, command: &str, args: Value) -> ClientResult<ServerResponse> {
        let server = self.ensure_started()?;
        match server.execute_impl(command, args, ExecuteInfo::background()) {
            Some(future) => future.await.map_err(ClientError::from),
            None => Ok(ServerResponse::Completed),
        }
    }

    /// Issue a request whose only acknowledgement is server state.
    pub fn execute_without_waiting(&self, command: &str, args: Value) -> ClientResult<()> {
        let server = self.ensure_started()?;
        server.execute_impl(command, args, ExecuteInfo::fire_and_forget());
        Ok(())
    }

    /// Open a buffer; recorded for replay across restarts.
    pub fn open_document(&self, args: Value) -> ClientResult<()> {
        self.buffer_sync.record_open(&args);
        self.execute_without_waiting("open", args)
    }

    pub fn change_document(&self, args: Value) -> ClientResult<()> {
        if let Some(file) = args.get("file").and_then(Value::as_str) {
            if let Ok(resource) = Url::from_file_path(file) {
                self.cancel_inflight_requests_for_resource(&resource);
            }
        }
        self.execute_without_waiting("change", args)
    }

    /// Close a buffer. Requests scoped to it are cancelled; their answers
    /// would describe a document that no longer exists.
    pub fn close_document(&self, file: &str) -> ClientResult<()> {
        self.buffer_sync.record_close(file);
        if let Ok(resource) = Url::from_file_path(file) {
            self.cancel_inflight_requests_for_resource(&resource);
        }
        self.execute_without_waiting("close", json!({ "file": file }))
    }

    /// Send host configuration; recorded for replay across restarts.
    pub fn configure(&self, args: Value) -> ClientResult<()> {
        self.buffer_sync.record_configure(&args);
        self.execute_without_waiting("configure", args)
    }

    /// Apply new configuration, restarting the topology when the change
    /// cannot take effect on a live server.
    pub fn reconfigure(&self, new: ClientConfiguration) -> ClientResult<()> {
        let needs_restart = self.config.load().requires_restart(&new);
        self.config.store(Arc::new(new));
        if needs_restart && self.is_running() {
            self.restart()
        } else {
            Ok(())
        }
    }

    pub fn cancel_inflight_requests_for_resource(&self, resource: &Url) {
        let inflight = self
            .inflight
            .lock()
            .recover_poisoned("cancel_inflight_requests_for_resource");
        for request in inflight.iter().filter(|r| &r.resource == resource) {
            request.token.cancel();
        }
    }

    fn track_inflight(&self, resource: Url, token: CancellationToken) -> u64 {
        let id = self.next_inflight_id.fetch_add(1, Ordering::Relaxed);
        self.inflight
            .lock()
            .recover_poisoned("track_inflight")
            .push(InflightRequest { id, resource, token });
        id
    }

    fn untrack_inflight(&self, id: u64) {
        self.inflight
            .lock()
            .recover_poisoned("untrack_inflight")
            .retain(|request| request.id != id);
    }

    fn ensure_started(&self) -> ClientResult<Arc<dyn LanguageServer>> {
        {
            let state = self.state.lock().recover_poisoned("ensure_started");
            match &*state {
                ServerState::Running { server, .. } => return Ok(server.clone()),
                ServerState::Errored { message } => {
                    return Err(ClientError::Errored(message.clone()));
                }
                ServerState::NotStarted => {}
            }
        }
        // Replay unconditionally: buffers recorded before a planned stop must
        // reach the replacement, and on a first start there is nothing to
        // replay.
        self.start_service(true)
    }

    /// Bump the generation and kill the running topology, if any. The exit
    /// notice the kill provokes carries a stale generation and is ignored.
    fn kill_current_topology(&self, why: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = mem::replace(
            &mut *self.state.lock().recover_poisoned("kill_current_topology"),
            ServerState::NotStarted,
        );
        if let ServerState::Running { server, .. } = previous {
            log::info!(target: "tsunagi::client", "killing analysis service ({})", why);
            server.kill();
        }
    }

    fn start_service(&self, resend_buffers: bool) -> ClientResult<Arc<dyn LanguageServer>> {
        {
            let restarts = self.restarts.lock().recover_poisoned("start_service");
            if restarts.permanently_failed {
                return Err(ClientError::PermanentlyFailed { restarts: MAX_RESTARTS });
            }
        }

        let config = self.config.load_full();
        let version = config
            .server_version
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(ProtocolVersion::DEFAULT);
        let delegate: Arc<dyn ServerDelegate> = self
            .weak_self
            .upgrade()
            .ok_or_else(|| ClientError::Errored("client dropped".to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let spawned = match spawn_topology(self.spawner.as_ref(), &config, version, &delegate) {
            Ok(spawned) => spawned,
            Err(e) => {
                *self.state.lock().recover_poisoned("start_service") = ServerState::Errored {
                    message: e.to_string(),
                };
                return Err(e);
            }
        };

        self.restarts
            .lock()
            .recover_poisoned("start_service")
            .last_start = Some(Instant::now());
        let server = spawned.server.clone();
        *self.state.lock().recover_poisoned("start_service") = ServerState::Running {
            server: server.clone(),
            version,
        };
        self.spawn_notice_pump(spawned.notices, generation);
        log::info!(
            target: "tsunagi::client",
            "analysis service started (protocol {})",
            version
        );
        let _ = self
            .notifications
            .send(ClientNotification::Started { version });

        if resend_buffers {
            self.buffer_sync.replay(server.as_ref());
        }
        Ok(server)
    }

    fn spawn_notice_pump(&self, mut notices: NoticeReceiver, generation: u64) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(client) = weak.upgrade() else { return };
                if client.generation.load(Ordering::SeqCst) != generation {
                    // A newer topology exists; this one's tail is stale.
                    return;
                }
                match notice {
                    ServerNotice::Event(event) => client.dispatch_event(event),
                    ServerNotice::Exit(code) => {
                        client.service_exited(code);
                        return;
                    }
                    ServerNotice::ProcessError(message) => {
                        log::error!(target: "tsunagi::client", "server process error: {}", message);
                    }
                    ServerNotice::ReaderError(message) => {
                        log::warn!(target: "tsunagi::client", "server stream error: {}", message);
                    }
                }
            }
        });
    }

    fn dispatch_event(&self, event: Event) {
        if let Some(kind) = DiagnosticsKind::from_event(&event.event) {
            if let Some(diagnostics) = parse_diagnostics_event(kind, &event) {
                let _ = self
                    .notifications
                    .send(ClientNotification::Diagnostics(diagnostics));
                return;
            }
        }
        let _ = self.notifications.send(ClientNotification::Event(event));
    }

    /// Unplanned topology exit: apply the restart policy.
    fn service_exited(&self, code: Option<i32>) {
        log::warn!(
            target: "tsunagi::client",
            "analysis service exited unexpectedly (code {:?})",
            code
        );
        *self.state.lock().recover_poisoned("service_exited") = ServerState::NotStarted;

        let restarting = {
            let mut restarts = self.restarts.lock().recover_poisoned("service_exited");
            restarts.unplanned_exits += 1;
            let since_start = restarts.last_start.map(|at| at.elapsed());
            let mut restart = true;
            if restarts.unplanned_exits > MAX_RESTARTS {
                restarts.unplanned_exits = 0;
                match since_start {
                    Some(elapsed) if elapsed < IMMEDIATE_CRASH_WINDOW => {
                        restarts.permanently_failed = true;
                        restart = false;
                        log::error!(
                            target: "tsunagi::client",
                            "analysis service died {} times right after starting; giving up",
                            MAX_RESTARTS
                        );
                    }
                    Some(elapsed) if elapsed < CRASH_STORM_WINDOW => {
                        log::warn!(
                            target: "tsunagi::client",
                            "analysis service crashed {} times in the last five minutes",
                            MAX_RESTARTS
                        );
                    }
                    _ => {}
                }
            }
            restart
        };

        let _ = self
            .notifications
            .send(ClientNotification::Exited { restarting });
        if restarting {
            if let Err(e) = self.start_service(true) {
                log::error!(target: "tsunagi::client", "restart failed: {}", e);
            }
        } else {
            let _ = self.notifications.send(ClientNotification::PermanentlyFailed);
        }
    }

    /// Non-recoverable failure: tear the topology down and stay down until a
    /// planned restart.
    fn fatal_error(&self, command: &str, error: ServerError) {
        log::error!(
            target: "tsunagi::client",
            "fatal error executing '{}': {}",
            command,
            error
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = mem::replace(
            &mut *self.state.lock().recover_poisoned("fatal_error"),
            ServerState::Errored {
                message: error.to_string(),
            },
        );
        if let ServerState::Running { server, .. } = previous {
            server.kill();
        }
        let _ = self.notifications.send(ClientNotification::FatalError {
            command: command.to_string(),
            message: error.to_string(),
        });
    }
}

impl ServerDelegate for ServiceClient {
    fn on_fatal_error(&self, command: &str, error: ServerError) {
        self.fatal_error(command, error);
    }
}

fn parse_diagnostics_event(kind: DiagnosticsKind, event: &Event) -> Option<DiagnosticsEvent> {
    let body = event.body.as_ref()?;
    let file = body.get("file")?.as_str()?;
    let resource = Url::from_file_path(file).ok()?;
    let diagnostics = body.get("diagnostics")?.as_array()?.clone();
    Some(DiagnosticsEvent { kind, resource, diagnostics })
}
