//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
///
/// Refusals that are part of normal operation (a post refused at shutdown,
/// a claim denied) are reported as `bool` or enum results instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The OS refused to create a worker or service thread.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),
    /// `start()` was called on a component that is already running.
    #[error("already started")]
    AlreadyStarted,
    /// The scheduler refused a post because shutdown has started.
    #[error("post refused")]
    PostRefused,
    /// A posted task was dropped before producing its result.
    #[error("task dropped before completion")]
    TaskDropped,
    /// A blocking join failed on the async bridge.
    #[error("join failed: {0}")]
    Join(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
