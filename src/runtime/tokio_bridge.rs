//! Bridge between the thread-pool scheduler and tokio.
//!
//! Blocking operations are moved to tokio's blocking pool; results of posted
//! tasks come back over a oneshot channel.

use std::future::Future;
use std::panic::Location;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::core::{JobHandle, SchedulerError, TaskRunner, TaskScheduler};

/// Join `handle` without blocking the async runtime.
///
/// # Errors
///
/// Returns `SchedulerError::Join` if the blocking join task failed.
pub async fn join_async(handle: JobHandle) -> Result<(), SchedulerError> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|e| SchedulerError::Join(e.to_string()))
}

/// Run `f` through `runner` and resolve to its return value.
///
/// The task is posted when this function is called, not when the future is
/// first polled.
///
/// # Errors
///
/// - `SchedulerError::PostRefused` if shutdown refused the task
/// - `SchedulerError::TaskDropped` if the task was dropped or panicked
#[track_caller]
pub fn post_task_and_reply_async<R, F, T>(
    runner: &R,
    f: F,
) -> impl Future<Output = Result<T, SchedulerError>> + Send + 'static
where
    R: TaskRunner + ?Sized,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let posted = runner.post_delayed_task_from(
        Location::caller(),
        Box::new(move || {
            if tx.send(f()).is_err() {
                debug!("reply dropped: receiver gone");
            }
        }),
        Duration::ZERO,
    );
    async move {
        if !posted {
            return Err(SchedulerError::PostRefused);
        }
        rx.await.map_err(|_| SchedulerError::TaskDropped)
    }
}

/// Shut `scheduler` down without blocking the async runtime.
///
/// # Errors
///
/// Returns `SchedulerError::Join` if the blocking shutdown task failed.
pub async fn shutdown_async(scheduler: &TaskScheduler) -> Result<(), SchedulerError> {
    let scheduler = scheduler.clone();
    tokio::task::spawn_blocking(move || scheduler.shutdown())
        .await
        .map_err(|e| SchedulerError::Join(e.to_string()))
}
