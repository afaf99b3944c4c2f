//! Runtime adapters for async callers.

#[cfg(feature = "tokio-runtime")]
pub mod tokio_bridge;

#[cfg(feature = "tokio-runtime")]
pub use tokio_bridge::{join_async, post_task_and_reply_async, shutdown_async};
