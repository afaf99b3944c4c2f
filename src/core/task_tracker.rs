//! Shutdown gating, flushing and execution fences.
//!
//! Every post goes through [`TaskTracker::will_post_task`] and every task
//! source sitting in a pool queue or held by a worker is registered through
//! [`TaskTracker::register_task_source`]. The tracker uses those counts to
//! decide when shutdown and flushes are complete.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::core::sequence::ScopedSequenceToken;
use crate::core::task::Task;
use crate::core::task_source::TaskSource;
use crate::core::traits::{TaskPriority, TaskShutdownBehavior};

/// Shutdown phase of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownState {
    /// Every post is accepted.
    NotStarted,
    /// Only BLOCK_SHUTDOWN posts are accepted; shutdown is draining.
    Started,
    /// Nothing is accepted anymore.
    Complete,
}

#[derive(Debug)]
struct TrackerState {
    shutdown: ShutdownState,
    num_items_blocking_shutdown: usize,
    num_incomplete_task_sources: usize,
}

/// Tracks posted work for shutdown and flush purposes.
pub struct TaskTracker {
    state: Mutex<TrackerState>,
    shutdown_cv: Condvar,
    flush_cv: Condvar,
    shutdown_started: AtomicBool,
    execution_fence: AtomicBool,
    best_effort_fence: AtomicBool,
    num_tasks_run: AtomicU64,
    num_tasks_panicked: AtomicU64,
}

impl TaskTracker {
    /// Create a tracker in the [`ShutdownState::NotStarted`] phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                shutdown: ShutdownState::NotStarted,
                num_items_blocking_shutdown: 0,
                num_incomplete_task_sources: 0,
            }),
            shutdown_cv: Condvar::new(),
            flush_cv: Condvar::new(),
            shutdown_started: AtomicBool::new(false),
            execution_fence: AtomicBool::new(false),
            best_effort_fence: AtomicBool::new(false),
            num_tasks_run: AtomicU64::new(0),
            num_tasks_panicked: AtomicU64::new(0),
        }
    }

    /// Decide whether `task` may be posted with `behavior`.
    ///
    /// Before shutdown everything is accepted. Once shutdown has started only
    /// immediate BLOCK_SHUTDOWN tasks are, and nothing after it completed.
    pub fn will_post_task(&self, task: &Task, behavior: TaskShutdownBehavior) -> bool {
        if !self.has_shutdown_started() {
            return true;
        }
        // Delayed BLOCK_SHUTDOWN tasks behave like SKIP_ON_SHUTDOWN.
        if behavior != TaskShutdownBehavior::BlockShutdown || task.is_delayed() {
            debug!(
                posted_from = %task.posted_from,
                ?behavior,
                "post refused: shutdown has started"
            );
            return false;
        }
        if self.is_shutdown_complete() {
            warn!(
                posted_from = %task.posted_from,
                "BLOCK_SHUTDOWN post refused: shutdown is complete"
            );
            return false;
        }
        true
    }

    /// Whether a delayed task that just became due may still be queued.
    pub fn can_post_delayed_task_now(&self) -> bool {
        !self.has_shutdown_started()
    }

    /// Register a task source that is about to be queued in a pool.
    ///
    /// Returns `None` if shutdown no longer allows the source to be queued.
    /// The returned guard unregisters the source when dropped.
    pub fn register_task_source(
        self: &Arc<Self>,
        source: Arc<dyn TaskSource>,
    ) -> Option<RegisteredTaskSource> {
        let behavior = source.traits().shutdown_behavior;
        {
            let mut state = self.state.lock();
            match state.shutdown {
                ShutdownState::Complete => {
                    warn!(?source, "task source refused: shutdown is complete");
                    return None;
                }
                ShutdownState::Started if behavior != TaskShutdownBehavior::BlockShutdown => {
                    debug!(?source, "task source refused: shutdown has started");
                    return None;
                }
                _ => {}
            }
            if behavior == TaskShutdownBehavior::BlockShutdown {
                state.num_items_blocking_shutdown += 1;
            }
            state.num_incomplete_task_sources += 1;
        }
        Some(RegisteredTaskSource {
            source,
            behavior,
            tracker: Arc::clone(self),
        })
    }

    fn unregister_task_source(&self, behavior: TaskShutdownBehavior) {
        let mut state = self.state.lock();
        state.num_incomplete_task_sources -= 1;
        if behavior == TaskShutdownBehavior::BlockShutdown {
            Self::decrement_blocking(&mut state, &self.shutdown_cv);
        }
        if state.num_incomplete_task_sources == 0 {
            self.flush_cv.notify_all();
        }
    }

    fn decrement_blocking(state: &mut TrackerState, shutdown_cv: &Condvar) {
        state.num_items_blocking_shutdown -= 1;
        if state.num_items_blocking_shutdown == 0 && state.shutdown == ShutdownState::Started {
            shutdown_cv.notify_all();
        }
    }

    /// Decide whether a task from a source with `behavior` may start now.
    /// A `true` result must be matched with one [`Self::after_run_task`].
    pub fn before_run_task(&self, behavior: TaskShutdownBehavior) -> bool {
        match behavior {
            // Counted when the source was registered.
            TaskShutdownBehavior::BlockShutdown => true,
            TaskShutdownBehavior::SkipOnShutdown => {
                let mut state = self.state.lock();
                if state.shutdown != ShutdownState::NotStarted {
                    return false;
                }
                // Running SKIP_ON_SHUTDOWN tasks block shutdown.
                state.num_items_blocking_shutdown += 1;
                true
            }
            TaskShutdownBehavior::ContinueOnShutdown => !self.has_shutdown_started(),
        }
    }

    /// Counterpart of a successful [`Self::before_run_task`].
    pub fn after_run_task(&self, behavior: TaskShutdownBehavior) {
        if behavior == TaskShutdownBehavior::SkipOnShutdown {
            let mut state = self.state.lock();
            Self::decrement_blocking(&mut state, &self.shutdown_cv);
        }
    }

    /// Run `task` on behalf of `source`. A panicking task is logged and
    /// counted; returns `false` in that case.
    pub fn run_task(&self, task: Task, source: &dyn TaskSource) -> bool {
        let posted_from = task.posted_from;
        let _scope = ScopedSequenceToken::enter(source.sequence_token());
        trace!(posted_from = %posted_from, "running task");

        let outcome = panic::catch_unwind(AssertUnwindSafe(move || task.run()));
        self.num_tasks_run.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(()) => true,
            Err(payload) => {
                self.num_tasks_panicked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    posted_from = %posted_from,
                    panic = panic_message(payload.as_ref()),
                    "task panicked"
                );
                false
            }
        }
    }

    /// Start shutdown and block until every BLOCK_SHUTDOWN source and every
    /// running SKIP_ON_SHUTDOWN task has completed.
    pub fn shutdown(&self) {
        self.start_shutdown();
        self.complete_shutdown();
    }

    /// Stop accepting non-BLOCK_SHUTDOWN work without waiting. Fences stop
    /// applying from here on.
    pub fn start_shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown != ShutdownState::NotStarted {
            return;
        }
        state.shutdown = ShutdownState::Started;
        self.shutdown_started.store(true, Ordering::Release);
        info!(
            blocking = state.num_items_blocking_shutdown,
            "shutdown started"
        );
    }

    /// Block until the work blocking shutdown is done, then refuse
    /// everything. Starts shutdown if needed.
    pub fn complete_shutdown(&self) {
        let mut state = self.state.lock();
        match state.shutdown {
            ShutdownState::Complete => {
                debug!("shutdown already complete");
                return;
            }
            ShutdownState::NotStarted => {
                state.shutdown = ShutdownState::Started;
                self.shutdown_started.store(true, Ordering::Release);
            }
            ShutdownState::Started => {}
        }
        while state.num_items_blocking_shutdown > 0 {
            self.shutdown_cv.wait(&mut state);
        }
        state.shutdown = ShutdownState::Complete;
        info!("shutdown complete");
    }

    /// Block until no registered task source remains queued or running.
    /// Delayed tasks that are not due yet are not waited for.
    pub fn flush_for_testing(&self) {
        let mut state = self.state.lock();
        while state.num_incomplete_task_sources > 0 {
            self.flush_cv.wait(&mut state);
        }
    }

    /// Current shutdown phase.
    pub fn shutdown_state(&self) -> ShutdownState {
        self.state.lock().shutdown
    }

    /// Whether shutdown has started (or completed).
    pub fn has_shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// Whether shutdown has completed.
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_state() == ShutdownState::Complete
    }

    /// Enable or disable the fence that stops all work from being handed out.
    pub fn set_execution_fence_enabled(&self, enabled: bool) {
        self.execution_fence.store(enabled, Ordering::Release);
    }

    /// Enable or disable the fence that stops BEST_EFFORT work from being
    /// handed out.
    pub fn set_best_effort_fence_enabled(&self, enabled: bool) {
        self.best_effort_fence.store(enabled, Ordering::Release);
    }

    /// Whether fences currently allow work of `priority` to start. Fences
    /// are ignored once shutdown has started.
    pub fn can_run_priority(&self, priority: TaskPriority) -> bool {
        if self.has_shutdown_started() {
            return true;
        }
        if self.execution_fence.load(Ordering::Acquire) {
            return false;
        }
        !(priority == TaskPriority::BestEffort && self.best_effort_fence.load(Ordering::Acquire))
    }

    /// Number of tasks run so far, panicking ones included.
    pub fn num_tasks_run(&self) -> u64 {
        self.num_tasks_run.load(Ordering::Relaxed)
    }

    /// Number of tasks that panicked.
    pub fn num_tasks_panicked(&self) -> u64 {
        self.num_tasks_panicked.load(Ordering::Relaxed)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("state", &*self.state.lock())
            .field("num_tasks_run", &self.num_tasks_run())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// A task source registered with a [`TaskTracker`]; unregisters on drop.
pub struct RegisteredTaskSource {
    source: Arc<dyn TaskSource>,
    behavior: TaskShutdownBehavior,
    tracker: Arc<TaskTracker>,
}

impl RegisteredTaskSource {
    /// The registered source.
    #[must_use]
    pub const fn source(&self) -> &Arc<dyn TaskSource> {
        &self.source
    }

    /// Shutdown behavior the source was registered with.
    #[must_use]
    pub const fn shutdown_behavior(&self) -> TaskShutdownBehavior {
        self.behavior
    }
}

impl Deref for RegisteredTaskSource {
    type Target = dyn TaskSource;

    fn deref(&self) -> &Self::Target {
        self.source.as_ref()
    }
}

impl Drop for RegisteredTaskSource {
    fn drop(&mut self) {
        self.tracker.unregister_task_source(self.behavior);
    }
}

impl fmt::Debug for RegisteredTaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTaskSource")
            .field("source", &self.source)
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}
