//! Best-effort cancellation side channel.
//!
//! Once a request has been transmitted, the only way to stop it is to signal
//! the process out of band: the server polls for files named
//! `<pipe><seq>` and abandons the matching request. Local resolution is
//! authoritative; the server-side effect is fire-and-forget and never
//! awaited.

use std::path::PathBuf;

use crate::protocol::RequestSeq;

/// Out-of-band cancellation for requests already on the wire.
pub trait OngoingRequestCanceller: Send + Sync {
    /// Signal the process to abandon work for `seq`. Returns whether a signal
    /// was actually sent; the result of the abandonment itself is unobserved.
    fn try_cancel_ongoing_request(&self, seq: RequestSeq) -> bool;
}

/// Canceller that touches `<pipe><seq>` marker files.
///
/// The pipe name is passed to the server at spawn time via
/// `--cancellationPipeName <pipe>*`; the trailing `*` tells the server the
/// sequence number is appended to the base name.
pub struct PipeRequestCanceller {
    server_id: String,
    pipe_name: Option<PathBuf>,
}

impl PipeRequestCanceller {
    pub fn new(server_id: impl Into<String>, pipe_name: Option<PathBuf>) -> Self {
        Self {
            server_id: server_id.into(),
            pipe_name,
        }
    }
}

impl OngoingRequestCanceller for PipeRequestCanceller {
    fn try_cancel_ongoing_request(&self, seq: RequestSeq) -> bool {
        let Some(pipe_name) = &self.pipe_name else {
            return false;
        };
        log::trace!(
            target: "tsunagi::canceller",
            "<{}> signalling cancellation for request {}",
            self.server_id,
            seq
        );
        let mut marker = pipe_name.clone().into_os_string();
        marker.push(seq.to_string());
        // Failure to write the marker just means the request runs to
        // completion; the local callback has already been resolved.
        let _ = std::fs::write(marker, b"");
        true
    }
}

/// Canceller for servers spawned without a cancellation pipe.
#[derive(Default)]
pub struct NoopRequestCanceller;

impl OngoingRequestCanceller for NoopRequestCanceller {
    fn try_cancel_ongoing_request(&self, _seq: RequestSeq) -> bool {
        false
    }
}
