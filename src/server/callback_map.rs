//! In-flight request bookkeeping.
//!
//! Associates a sequence number with the continuation that must run when the
//! request completes. Exactly one resolution per sequence number: fetch
//! removes the entry, so a late response for an already-resolved sequence
//! finds nothing and is ignored.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::protocol::RequestSeq;

use super::error::ServerError;
use super::{ServerResponse, ServerResult};

/// Continuation for one in-flight request.
#[derive(Debug)]
pub struct PendingCallback {
    sender: oneshot::Sender<ServerResult>,
    pub queuing_start: Instant,
    pub is_async: bool,
}

impl PendingCallback {
    /// Resolve the callback. Consumes it; a dropped receiver is fine.
    pub fn resolve(self, result: ServerResult) {
        let _ = self.sender.send(result);
    }
}

/// Table of pending callbacks for one server process.
///
/// Async callbacks are tracked separately because their sequence numbers stay
/// live across many interleaved responses, but fetch semantics are identical.
/// Owned per engine; multiple engines coexist with independent tables.
#[derive(Debug, Default)]
pub struct CallbackMap {
    callbacks: DashMap<RequestSeq, PendingCallback>,
    async_callbacks: DashMap<RequestSeq, PendingCallback>,
}

impl CallbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, returning the receiver the caller awaits.
    ///
    /// At most one callback may exist per live sequence number; the queue's
    /// monotone counter guarantees the key is fresh.
    pub fn add(&self, seq: RequestSeq, is_async: bool) -> oneshot::Receiver<ServerResult> {
        let (sender, receiver) = oneshot::channel();
        let callback = PendingCallback {
            sender,
            queuing_start: Instant::now(),
            is_async,
        };
        if is_async {
            self.async_callbacks.insert(seq, callback);
        } else {
            self.callbacks.insert(seq, callback);
        }
        receiver
    }

    /// Remove and return the callback for a sequence number, if still live.
    pub fn fetch(&self, seq: RequestSeq) -> Option<PendingCallback> {
        self.callbacks
            .remove(&seq)
            .or_else(|| self.async_callbacks.remove(&seq))
            .map(|(_, callback)| callback)
    }

    /// Resolve every outstanding callback with a terminal failure and clear
    /// the table. Used on process exit, error, and disposal; no callback may
    /// be silently dropped.
    pub fn destroy(&self, server_id: &str, cause: &str) {
        let drain = |map: &DashMap<RequestSeq, PendingCallback>| {
            let seqs: Vec<RequestSeq> = map.iter().map(|entry| *entry.key()).collect();
            for seq in seqs {
                if let Some((_, callback)) = map.remove(&seq) {
                    callback.resolve(Err(ServerError::terminated(server_id, cause)));
                }
            }
        };
        drain(&self.callbacks);
        drain(&self.async_callbacks);
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.async_callbacks.is_empty()
    }
}
