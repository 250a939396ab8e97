//! Multi-process server shapes.
//!
//! Both topologies compose two engines behind one [`LanguageServer`] so the
//! service client never knows how many processes it is talking to. A
//! [`SyntaxRoutingServer`] answers purely syntactic queries from a
//! project-less process while the full semantic process loads; a
//! [`DiagnosticsRoutingServer`] isolates whole-file diagnostics computation
//! from the interactive request stream.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::router::{RequestRouter, RouteEntry};
use super::{
    ExecuteInfo, LanguageServer, NoticeReceiver, NoticeSender, ResponseFuture, ServerDelegate,
    ServerNotice, SpawnedServer,
};

/// Commands a project-less syntax process can always answer.
const SYNTAX_COMMANDS: &[&str] = &[
    "navtree",
    "getOutliningSpans",
    "jsxClosingTag",
    "selectionRange",
    "format",
    "formatonkey",
    "docCommentTemplate",
];

/// Events carrying diagnostics, produced only by the diagnostics process in
/// the [`DiagnosticsRoutingServer`] shape.
const DIAGNOSTIC_EVENTS: &[&str] = &[
    "configFileDiag",
    "syntaxDiag",
    "semanticDiag",
    "suggestionDiag",
];

/// Forward a child's notices into the combined stream.
///
/// `filter` decides per notice whether it is republished; `on_exit` runs on
/// the child's exit notice before filtering, which is where sibling kills
/// hang.
fn pump_notices(
    mut child: NoticeReceiver,
    combined: NoticeSender,
    filter: impl Fn(&ServerNotice) -> bool + Send + 'static,
    on_exit: impl Fn() + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(notice) = child.recv().await {
            if matches!(notice, ServerNotice::Exit(_)) {
                on_exit();
            }
            if filter(&notice) {
                let _ = combined.send(notice);
            }
        }
    });
}

/// Syntax process + semantic process behind one facade.
///
/// The semantic server is the lifeline: its exit is the topology's exit and
/// takes the syntax server down with it. A dead syntax server is tolerated;
/// its commands then fail individually without ending the topology.
pub struct SyntaxRoutingServer {
    router: RequestRouter,
    syntax: Arc<dyn LanguageServer>,
    semantic: Arc<dyn LanguageServer>,
}

impl SyntaxRoutingServer {
    pub fn new(
        syntax: SpawnedServer,
        semantic: SpawnedServer,
        delegate: Arc<dyn ServerDelegate>,
    ) -> (Arc<Self>, NoticeReceiver) {
        let (notices, notice_rx) = mpsc::unbounded_channel();

        pump_notices(
            syntax.notices,
            notices.clone(),
            |notice| !matches!(notice, ServerNotice::Exit(_)),
            || log::info!(target: "tsunagi::topology", "syntax server exited"),
        );
        let syntax_handle = syntax.server.clone();
        pump_notices(semantic.notices, notices, |_| true, move || {
            syntax_handle.kill();
        });

        let router = RequestRouter::new(
            vec![
                RouteEntry::filtered(syntax.server.clone(), |command, _| {
                    SYNTAX_COMMANDS.contains(&command)
                }),
                RouteEntry::catch_all(semantic.server.clone()),
            ],
            delegate,
        );
        let server = Arc::new(Self {
            router,
            syntax: syntax.server,
            semantic: semantic.server,
        });
        (server, notice_rx)
    }
}

impl LanguageServer for SyntaxRoutingServer {
    fn server_id(&self) -> &str {
        "syntax/semantic"
    }

    fn execute_impl(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture> {
        self.router.execute(command, args, info)
    }

    fn kill(&self) {
        self.syntax.kill();
        self.semantic.kill();
    }
}

/// Diagnostics process + primary process behind one facade.
///
/// Diagnostics requests (`geterr`, `geterrForProject`) and the events they
/// produce belong to the diagnostics process; everything else belongs to the
/// primary. Diagnostic events from the primary are suppressed so each event
/// kind has exactly one producer.
pub struct DiagnosticsRoutingServer {
    router: RequestRouter,
    diagnostics: Arc<dyn LanguageServer>,
    primary: Arc<dyn LanguageServer>,
}

impl DiagnosticsRoutingServer {
    pub fn new(
        diagnostics: SpawnedServer,
        primary: SpawnedServer,
        delegate: Arc<dyn ServerDelegate>,
    ) -> (Arc<Self>, NoticeReceiver) {
        let (notices, notice_rx) = mpsc::unbounded_channel();

        pump_notices(
            diagnostics.notices,
            notices.clone(),
            |notice| match notice {
                ServerNotice::Event(event) => DIAGNOSTIC_EVENTS.contains(&event.event.as_str()),
                ServerNotice::Exit(_) => false,
                _ => true,
            },
            || log::info!(target: "tsunagi::topology", "diagnostics server exited"),
        );
        let diagnostics_handle = diagnostics.server.clone();
        pump_notices(
            primary.notices,
            notices,
            |notice| match notice {
                ServerNotice::Event(event) => !DIAGNOSTIC_EVENTS.contains(&event.event.as_str()),
                _ => true,
            },
            move || diagnostics_handle.kill(),
        );

        let router = RequestRouter::new(
            vec![
                RouteEntry::filtered(diagnostics.server.clone(), |command, _| {
                    command == "geterr" || command == "geterrForProject"
                }),
                RouteEntry::catch_all(primary.server.clone()),
            ],
            delegate,
        );
        let server = Arc::new(Self {
            router,
            diagnostics: diagnostics.server,
            primary: primary.server,
        });
        (server, notice_rx)
    }
}

impl LanguageServer for DiagnosticsRoutingServer {
    fn server_id(&self) -> &str {
        "diagnostics/primary"
    }

    fn execute_impl(&self, command: &str, args: Value, info: ExecuteInfo) -> Option<ResponseFuture> {
        self.router.execute(command, args, info)
    }

    fn kill(&self) {
        self.diagnostics.kill();
        self.primary.kill();
    }
}
