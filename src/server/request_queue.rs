//! Ordering of not-yet-sent requests.
//!
//! The queue owns the per-process sequence counter and the priority placement
//! rules. Placement is the only reordering that ever happens; once dequeued a
//! request goes to the wire immediately.

use std::collections::VecDeque;

use serde_json::Value;

use crate::protocol::{Request, RequestSeq};

/// Queueing class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestQueueingKind {
    Normal,
    /// May be preempted by later normal-priority requests.
    LowPriority,
    /// Mutates shared buffer state; must never be reordered relative to
    /// anything already queued.
    Fence,
}

/// A request waiting to be written to the transport.
///
/// Created when a caller issues a command; destroyed when dequeued and sent.
#[derive(Debug, Clone)]
pub struct RequestItem {
    pub request: Request,
    pub expects_response: bool,
    pub is_async: bool,
    pub queueing_kind: RequestQueueingKind,
}

/// Priority queue of pending requests plus the process's sequence counter.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: VecDeque<RequestItem>,
    next_seq: RequestSeq,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Build a request with the next sequence number. Numbers are strictly
    /// increasing and never reused for the lifetime of the queue.
    pub fn create_request(&mut self, command: &str, arguments: Value) -> Request {
        let seq = self.next_seq;
        self.next_seq += 1;
        Request {
            seq,
            command: command.to_string(),
            arguments,
        }
    }

    /// Insert an item according to its queueing class.
    ///
    /// Normal requests jump ahead of any trailing run of low-priority items;
    /// low-priority and fence requests always append, so a fence is never
    /// reordered relative to the requests queued before it.
    pub fn enqueue(&mut self, item: RequestItem) {
        if item.queueing_kind == RequestQueueingKind::Normal {
            let mut index = self.queue.len();
            while index > 0
                && self.queue[index - 1].queueing_kind == RequestQueueingKind::LowPriority
            {
                index -= 1;
            }
            self.queue.insert(index, item);
        } else {
            self.queue.push_back(item);
        }
    }

    pub fn dequeue(&mut self) -> Option<RequestItem> {
        self.queue.pop_front()
    }

    /// Remove a still-queued request. Returns false if it was already sent
    /// (or never existed); cancellation then has to go through the
    /// out-of-band canceller instead.
    pub fn try_delete(&mut self, seq: RequestSeq) -> bool {
        let Some(index) = self.queue.iter().position(|item| item.request.seq == seq) else {
            return false;
        };
        self.queue.remove(index);
        true
    }
}
