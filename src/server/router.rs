//! Command routing across several server engines.
//!
//! Two routing regimes coexist. Commands that mutate shared buffer state fan
//! out to every server so all processes keep an identical view of open
//! documents; everything else goes to the first server whose predicate
//! accepts the command. The fan-out path watches each copy's outcome and
//! escalates through the delegate when the servers diverge, since a split
//! buffer view silently corrupts every later answer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::LockRecoverExt;

use super::error::ServerError;
use super::{ExecuteInfo, LanguageServer, ResponseFuture, ServerDelegate};

/// Commands replicated to every server in the topology.
pub const SHARED_COMMANDS: &[&str] = &[
    "change",
    "close",
    "open",
    "updateOpen",
    "configure",
    "configurePlugin",
];

/// Per-server outcome of one fanned-out command.
#[derive(Debug, Clone)]
enum RequestState {
    Unresolved,
    Resolved,
    Errored(ServerError),
}

/// One routed server plus the predicate deciding which non-shared commands it
/// handles. `None` accepts everything, so the catch-all server goes last.
pub struct RouteEntry {
    pub server: Arc<dyn LanguageServer>,
    pub can_run: Option<Box<dyn Fn(&str, &ExecuteInfo) -> bool + Send + Sync>>,
}

impl RouteEntry {
    pub fn catch_all(server: Arc<dyn LanguageServer>) -> Self {
        Self { server, can_run: None }
    }

    pub fn filtered(
        server: Arc<dyn LanguageServer>,
        can_run: impl Fn(&str, &ExecuteInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { server, can_run: Some(Box::new(can_run)) }
    }
}

/// Routes commands onto an ordered list of servers.
pub struct RequestRouter {
    servers: Vec<RouteEntry>,
    delegate: Arc<dyn ServerDelegate>,
}

impl RequestRouter {
    pub fn new(servers: Vec<RouteEntry>, delegate: Arc<dyn ServerDelegate>) -> Self {
        Self { servers, delegate }
    }

    pub fn execute(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture> {
        if SHARED_COMMANDS.contains(&command) {
            return self.execute_shared(command, args, info);
        }

        for entry in &self.servers {
            let accepts = entry
                .can_run
                .as_ref()
                .map(|can_run| can_run(command, &info))
                .unwrap_or(true);
            if accepts {
                return entry.server.execute_impl(command, args, info);
            }
        }

        log::error!(target: "tsunagi::router", "no server accepts command '{}'", command);
        if !info.expects_result {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(ServerError::NoServerForCommand {
            command: command.to_string(),
        }));
        Some(ResponseFuture::new(receiver))
    }

    /// Fan a state-mutating command out to every server.
    ///
    /// The caller observes the primary (first) server's result. Each copy's
    /// outcome is tracked so that one server applying the mutation while
    /// another rejects it is caught and escalated exactly once.
    fn execute_shared(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture> {
        let states: Arc<Mutex<Vec<RequestState>>> = Arc::new(Mutex::new(
            self.servers.iter().map(|_| RequestState::Unresolved).collect(),
        ));
        let fatal_fired = Arc::new(AtomicBool::new(false));

        // A caller-side cancellation must hit either every copy or none:
        // cancelling only some of them is itself a divergence. Once any copy
        // has resolved, the cancellation is ignored.
        let inner_token = info.token.as_ref().map(|outer| {
            let inner = CancellationToken::new();
            let outer = outer.clone();
            let child = inner.clone();
            let states = states.clone();
            tokio::spawn(async move {
                outer.cancelled().await;
                let any_resolved = states
                    .lock()
                    .recover_poisoned("shared cancellation guard")
                    .iter()
                    .any(|state| matches!(state, RequestState::Resolved));
                if !any_resolved {
                    child.cancel();
                }
            });
            inner
        });

        let mut primary: Option<ResponseFuture> = None;
        for (index, entry) in self.servers.iter().enumerate() {
            let per_server = ExecuteInfo {
                token: inner_token.clone(),
                ..info.clone()
            };
            let request = entry.server.execute_impl(command, args.clone(), per_server);

            let Some(request) = request else {
                if index == 0 {
                    primary = None;
                }
                continue;
            };

            let (sender, receiver) = oneshot::channel();
            if index == 0 {
                primary = Some(ResponseFuture::new(receiver));
            }

            let states = states.clone();
            let fatal_fired = fatal_fired.clone();
            let delegate = self.delegate.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                let result = request.await;
                let divergence = {
                    let mut states = states.lock().recover_poisoned("shared request state");
                    match &result {
                        Ok(_) => {
                            states[index] = RequestState::Resolved;
                            states.iter().find_map(|state| match state {
                                RequestState::Errored(err) => Some(err.clone()),
                                _ => None,
                            })
                        }
                        Err(err) => {
                            states[index] = RequestState::Errored(err.clone());
                            states
                                .iter()
                                .any(|state| matches!(state, RequestState::Resolved))
                                .then(|| err.clone())
                        }
                    }
                };
                if let Some(err) = divergence {
                    if !fatal_fired.swap(true, Ordering::SeqCst) {
                        delegate.on_fatal_error(&command, err);
                    }
                }
                if index == 0 {
                    let _ = sender.send(result);
                }
            });
        }
        primary
    }
}
