//! Open-buffer bookkeeping for crash recovery.
//!
//! A restarted server process starts with no knowledge of open documents.
//! The client records the `open` arguments of every live buffer (and the
//! last `configure`) so a fresh topology can be brought back to the
//! pre-crash view before any further request is issued.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::LockRecoverExt;
use crate::server::{ExecuteInfo, LanguageServer};

#[derive(Debug, Default)]
pub struct BufferSync {
    /// `open` arguments keyed by file path, in stable replay order.
    open_args: Mutex<BTreeMap<String, Value>>,
    configure_args: Mutex<Option<Value>>,
}

impl BufferSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the arguments a buffer was opened with. Re-opening the same
    /// file replaces the recorded arguments.
    pub fn record_open(&self, args: &Value) {
        let Some(file) = args.get("file").and_then(Value::as_str) else {
            return;
        };
        self.open_args
            .lock()
            .recover_poisoned("BufferSync::record_open")
            .insert(file.to_string(), args.clone());
    }

    pub fn record_close(&self, file: &str) {
        self.open_args
            .lock()
            .recover_poisoned("BufferSync::record_close")
            .remove(file);
    }

    pub fn record_configure(&self, args: &Value) {
        *self
            .configure_args
            .lock()
            .recover_poisoned("BufferSync::record_configure") = Some(args.clone());
    }

    pub fn open_files(&self) -> Vec<String> {
        self.open_args
            .lock()
            .recover_poisoned("BufferSync::open_files")
            .keys()
            .cloned()
            .collect()
    }

    /// Replay configuration and open buffers into a fresh server.
    ///
    /// Everything goes out fire-and-forget; `configure` first so the replayed
    /// buffers are parsed under the right settings.
    pub fn replay(&self, server: &dyn LanguageServer) {
        let configure = self
            .configure_args
            .lock()
            .recover_poisoned("BufferSync::replay")
            .clone();
        if let Some(args) = configure {
            server.execute_impl("configure", args, ExecuteInfo::fire_and_forget());
        }
        let opens: Vec<Value> = self
            .open_args
            .lock()
            .recover_poisoned("BufferSync::replay")
            .values()
            .cloned()
            .collect();
        let count = opens.len();
        for args in opens {
            server.execute_impl("open", args, ExecuteInfo::fire_and_forget());
        }
        log::debug!(target: "tsunagi::buffer_sync", "replayed {} open buffers", count);
    }
}
