//! Child process handle behind the engine.
//!
//! [`ServerProcess`] is the narrow seam between an engine and its OS process:
//! synchronous, ordered request submission plus kill. The real implementation
//! forwards frames to a writer task that owns the child's stdin; tests
//! substitute an in-memory fake.

use std::io;
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};

use crate::error::LockRecoverExt;
use crate::protocol::Request;
use crate::wire::encode_request;

/// Transport-facing view of one child process.
///
/// `write` must not call back into the engine: the engine invokes it while
/// holding its dispatch lock.
pub trait ServerProcess: Send + Sync {
    /// Submit a request for transmission. Ordering of calls is preserved on
    /// the wire. Fails once the process is gone.
    fn write(&self, request: &Request) -> io::Result<()>;

    /// Ask the process to die. Idempotent; the exit watcher reports the
    /// resulting exit through the engine.
    fn kill(&self);
}

/// A real child process spawned with piped stdio.
pub struct ChildServerProcess {
    server_id: String,
    requests: mpsc::UnboundedSender<Request>,
    kill_signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChildServerProcess {
    /// Wrap a freshly spawned child.
    ///
    /// Takes ownership of the child's stdin for the writer task and hands the
    /// child itself to the caller-provided exit watcher via the returned
    /// pieces: the process handle, the kill receiver the watcher must select
    /// on, and the child whose `wait()` the watcher owns.
    pub fn new(
        server_id: impl Into<String>,
        mut child: Child,
    ) -> io::Result<(Self, Child, oneshot::Receiver<()>)> {
        let server_id = server_id.into();
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child spawned without piped stdin")
        })?;

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(writer_loop(server_id.clone(), stdin, request_rx));

        Ok((
            Self {
                server_id,
                requests,
                kill_signal: Mutex::new(Some(kill_tx)),
            },
            child,
            kill_rx,
        ))
    }
}

impl ServerProcess for ChildServerProcess {
    fn write(&self, request: &Request) -> io::Result<()> {
        self.requests
            .send(request.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server process is gone"))
    }

    fn kill(&self) {
        let sender = self
            .kill_signal
            .lock()
            .recover_poisoned("ChildServerProcess::kill")
            .take();
        if let Some(sender) = sender {
            log::debug!(target: "tsunagi::process", "<{}> kill requested", self.server_id);
            let _ = sender.send(());
        }
    }
}

/// Writer task: drains queued requests into the child's stdin in order.
async fn writer_loop(
    server_id: String,
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = requests.recv().await {
        let bytes = match encode_request(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!(
                    target: "tsunagi::process",
                    "<{}> dropping unencodable request {}: {}",
                    server_id,
                    request.seq,
                    e
                );
                continue;
            }
        };
        if let Err(e) = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await
        {
            // Stream failure here surfaces through the exit watcher; the
            // engine resolves the pending callbacks when the process dies.
            log::warn!(
                target: "tsunagi::process",
                "<{}> stdin write failed: {}",
                server_id,
                e
            );
            break;
        }
    }
}
