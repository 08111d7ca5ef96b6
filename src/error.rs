//! Error types for testshift
//!
//! Failures raised by a test body never show up here: they are recorded in
//! that work item's [`TestResult`](crate::work_item::TestResult). These errors
//! describe scheduler misuse and conditions the dispatcher has to react to.

use std::time::Duration;
use thiserror::Error;

/// Main error type for testshift operations
#[derive(Error, Debug)]
pub enum Error {
    /// An OS thread could not be created
    #[error("Failed to spawn thread '{name}': {reason}")]
    SpawnError {
        /// Name of the thread that failed to start
        name: String,
        /// Reason for the spawn failure
        reason: String,
    },

    /// A worker or pump thread panicked and could not be joined cleanly
    #[error("Thread '{name}' panicked")]
    ThreadPanicked {
        /// Name of the thread that panicked
        name: String,
    },

    /// `run()` was called from inside a continuation already running on the context
    #[error("SingleThreadedContext::run called re-entrantly")]
    ReentrantRun,

    /// `run()` was called while another thread owns the context
    #[error("SingleThreadedContext is already running on another thread")]
    AlreadyRunning,

    /// The context has terminated and accepts no more work
    #[error("SingleThreadedContext has terminated")]
    ContextTerminated,

    /// The shutdown timeout elapsed while work was still outstanding
    #[error("Work still outstanding {timeout:?} after shutdown; {discarded} queued continuations discarded")]
    ForcedShutdown {
        /// Shutdown timeout that was exceeded
        timeout: Duration,
        /// Number of continuations that were dropped without running
        discarded: usize,
    },

    /// Work was posted after the shutdown window closed
    #[error("Work posted after shutdown timeout of {timeout:?} elapsed")]
    PostAfterShutdown {
        /// Shutdown timeout that had elapsed
        timeout: Duration,
    },

    /// An async test body exceeded its own timeout
    #[error("Test exceeded timeout value of {timeout:?}")]
    TestTimedOut {
        /// Configured test timeout
        timeout: Duration,
    },

    /// The context stopped before the future being driven completed
    #[error("Async body did not complete before the context shut down")]
    Incomplete,

    /// Runtime error
    #[error("Runtime error: {reason}")]
    RuntimeError {
        /// Reason for the runtime error
        reason: String,
    },
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
