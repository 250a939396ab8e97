//! Spawning server processes and assembling topologies.
//!
//! [`Spawner`] is the seam between process creation and everything above it:
//! the production [`ProcessSpawner`] forks real children with piped stdio,
//! while tests substitute in-memory fakes. [`spawn_topology`] decides, from
//! configuration and version, whether the logical server is one process or a
//! routed composite.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::process::Command;

use crate::config::ClientConfiguration;
use crate::error::{ClientError, ClientResult};
use crate::version::ProtocolVersion;

use super::canceller::PipeRequestCanceller;
use super::engine::{ProcessServer, read_loop};
use super::process::ChildServerProcess;
use super::topology::{DiagnosticsRoutingServer, SyntaxRoutingServer};
use super::{ServerDelegate, SpawnedServer};

/// Role a spawned process plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Sole process handling everything.
    Main,
    /// Project-less process answering syntactic queries.
    Syntax,
    /// Full-project process paired with a syntax server.
    Semantic,
    /// Background process running diagnostics sweeps.
    Diagnostics,
}

impl ServerKind {
    pub fn id(self) -> &'static str {
        match self {
            ServerKind::Main => "main",
            ServerKind::Syntax => "syntax",
            ServerKind::Semantic => "semantic",
            ServerKind::Diagnostics => "diagnostics",
        }
    }
}

/// Creates one running server process of a given kind.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        kind: ServerKind,
        config: &ClientConfiguration,
        version: ProtocolVersion,
    ) -> ClientResult<SpawnedServer>;
}

/// Production spawner: forks the configured executable with piped stdio.
#[derive(Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(
        &self,
        kind: ServerKind,
        config: &ClientConfiguration,
        version: ProtocolVersion,
    ) -> ClientResult<SpawnedServer> {
        // Per-process scratch dir for cancellation markers and the log file.
        // Owned by the exit watcher so it outlives the process and is cleaned
        // up when the process dies.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("tsunagi-{}-", kind.id()))
            .tempdir()?;
        let cancellation_pipe = scratch.path().join("cancellation-");
        let log_file = config.resolved_log_dir().and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::warn!(
                    target: "tsunagi::spawner",
                    "cannot create log dir {}: {}; server logging disabled",
                    dir.display(),
                    e
                );
                return None;
            }
            Some(dir.join(format!("tsserver-{}.log", kind.id())))
        });

        let args = build_server_args(kind, config, version, &cancellation_pipe, log_file.as_deref());
        log::info!(
            target: "tsunagi::spawner",
            "starting {} server: {} {}",
            kind.id(),
            config.server_path.display(),
            args.join(" ")
        );

        let mut command = Command::new(&config.server_path);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(memory) = config.max_server_memory {
            command.env("NODE_OPTIONS", format!("--max-old-space-size={}", memory));
        }
        let child = command.spawn().map_err(|e| {
            ClientError::Spawn(format!("{}: {}", config.server_path.display(), e))
        })?;

        let (process, mut child, kill_rx) = ChildServerProcess::new(kind.id(), child)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Spawn("child spawned without piped stdout".to_string())
        })?;

        let canceller = Arc::new(PipeRequestCanceller::new(kind.id(), Some(cancellation_pipe)));
        let (engine, notices) = ProcessServer::new(kind.id(), version, Arc::new(process), canceller);

        tokio::spawn(read_loop(engine.clone(), BufReader::new(stdout)));

        let watcher = engine.clone();
        tokio::spawn(async move {
            let _scratch = scratch;
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        watcher.handle_process_error(format!(
                            "waiting on the server process failed: {}",
                            e
                        ));
                        None
                    }
                },
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            watcher.handle_exit(code);
        });

        Ok(SpawnedServer { server: engine, notices })
    }
}

/// Spawn the whole logical server for the given configuration.
///
/// With a separate syntax server enabled (and a new enough version) the
/// primary becomes a syntax/semantic pair; with project diagnostics enabled
/// the primary is additionally wrapped with a dedicated diagnostics process.
pub fn spawn_topology(
    spawner: &dyn Spawner,
    config: &ClientConfiguration,
    version: ProtocolVersion,
    delegate: &Arc<dyn ServerDelegate>,
) -> ClientResult<SpawnedServer> {
    let primary = if config.use_separate_syntax_server && version >= ProtocolVersion::V340 {
        let syntax = spawner.spawn(ServerKind::Syntax, config, version)?;
        let semantic = spawner.spawn(ServerKind::Semantic, config, version)?;
        let (server, notices) = SyntaxRoutingServer::new(syntax, semantic, delegate.clone());
        SpawnedServer { server, notices }
    } else {
        spawner.spawn(ServerKind::Main, config, version)?
    };

    if !config.enable_project_diagnostics {
        return Ok(primary);
    }
    let diagnostics = spawner.spawn(ServerKind::Diagnostics, config, version)?;
    let (server, notices) = DiagnosticsRoutingServer::new(diagnostics, primary, delegate.clone());
    Ok(SpawnedServer { server, notices })
}

/// Assemble the version-gated command line for one server process.
fn build_server_args(
    kind: ServerKind,
    config: &ClientConfiguration,
    version: ProtocolVersion,
    cancellation_pipe: &Path,
    log_file: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if kind == ServerKind::Syntax {
        if version >= ProtocolVersion::V340 {
            args.push("--serverMode".into());
            args.push("partialSemantic".into());
        } else {
            args.push("--syntaxOnly".into());
        }
    }

    if version >= ProtocolVersion::V250 {
        args.push("--useInferredProjectPerProjectRoot".into());
    }

    if kind == ServerKind::Syntax || config.disable_automatic_typing_acquisition {
        args.push("--disableAutomaticTypingAcquisition".into());
    }

    // Trailing '*' tells the server the request seq is appended to the base
    // marker name.
    args.push("--cancellationPipeName".into());
    args.push(format!("{}*", cancellation_pipe.display()));

    if let Some(log_file) = log_file {
        args.push("--logVerbosity".into());
        args.push(config.log_verbosity.as_flag().into());
        args.push("--logFile".into());
        args.push(log_file.display().to_string());
    }

    if version >= ProtocolVersion::V260 {
        if let Some(locale) = &config.locale {
            args.push("--locale".into());
            args.push(locale.clone());
        }
    }

    if version >= ProtocolVersion::V291 {
        args.push("--noGetErrOnBackgroundUpdate".into());
    }

    if version >= ProtocolVersion::V345 {
        args.push("--validateDefaultNpmLocation".into());
    }

    args
}
