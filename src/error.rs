//! Error handling types for tsunagi.
//!
//! Per-request server errors live in [`crate::server::error`]; this module
//! holds the crate-wide error type for configuration, spawning, and
//! orchestrator-level failures.

use std::sync::PoisonError;
use thiserror::Error;

/// Comprehensive error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid or unreadable configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The server executable could not be started
    #[error("Failed to spawn analysis server: {0}")]
    Spawn(String),

    /// The crash-storm threshold was exceeded; no further restarts
    #[error("The analysis service died {restarts} times right after starting and will not be restarted")]
    PermanentlyFailed { restarts: u32 },

    /// The service is in an errored state and awaiting restart
    #[error("Analysis service errored: {0}")]
    Errored(String),

    /// A request failed at the server layer
    #[error(transparent)]
    Server(#[from] crate::server::error::ServerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Helper trait to recover from poisoned locks with logging.
///
/// State guarded by a `std::sync::Mutex` here stays consistent even if a
/// holder panicked, so recovery is always preferred over propagating the
/// poison.
pub trait LockRecoverExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation
    /// triggered the recovery.
    fn recover_poisoned(self, context: &str) -> T;
}

impl<T> LockRecoverExt<T> for Result<T, PoisonError<T>> {
    fn recover_poisoned(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "tsunagi::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
