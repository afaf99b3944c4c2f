//! Worker pool: a fixed set of OS threads pulling task sources from a
//! priority-ordered ready queue.
//!
//! Each idle worker repeatedly claims the highest-keyed task source
//! (`will_run_task`), runs one task from it, releases the claim
//! (`did_process_task`) and re-enqueues the source if it has more work.
//!
//! # Design Principles
//!
//! - **No polling**: idle workers block on a `Condvar` until work is pushed
//! - **Lock order**: the pool lock may be held while locking a task source,
//!   never the other way around
//! - **Clean shutdown**: dropping the pool wakes workers, which then exit

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::WorkerPoolParams;
use crate::core::error::SchedulerError;
use crate::core::priority_queue::PriorityQueue;
use crate::core::task_source::{RunStatus, SortKey, TaskSource};
use crate::core::task_tracker::{RegisteredTaskSource, TaskTracker};
use crate::core::traits::{TaskPriority, TaskTraits};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Which of the scheduler's pools a task source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Runs USER_BLOCKING and USER_VISIBLE work, and BEST_EFFORT work when
    /// there is no background pool.
    Foreground,
    /// Runs BEST_EFFORT work.
    Background,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foreground => f.write_str("foreground"),
            Self::Background => f.write_str("background"),
        }
    }
}

/// Callbacks from a pool into the scheduler that owns it.
pub trait WorkerPoolDelegate: Send + Sync {
    /// Pool that sources with `traits` belong to.
    fn pool_kind_for_traits(&self, traits: TaskTraits) -> PoolKind;

    /// Queue a source whose traits now map to another pool.
    fn re_enqueue_changing_pool(&self, source: RegisteredTaskSource, kind: PoolKind);
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Claims currently being run.
    pub running_task_sources: usize,
    /// BEST_EFFORT claims currently being run.
    pub running_best_effort: usize,
    /// Task sources waiting in the ready queue.
    pub queued_task_sources: usize,
    /// Workers blocked waiting for work.
    pub idle_workers: usize,
    /// Tasks that ran to completion.
    pub completed_tasks: u64,
    /// Tasks that panicked.
    pub panicked_tasks: u64,
    /// Claims released without running because of shutdown.
    pub skipped_claims: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
struct PoolCounters {
    completed_tasks: AtomicU64,
    panicked_tasks: AtomicU64,
    skipped_claims: AtomicU64,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: PriorityQueue,
    num_running: usize,
    num_running_best_effort: usize,
    num_idle: usize,
    num_workers: usize,
    join_requested: bool,
}

/// A claim granted to a worker.
struct Claim {
    source: RegisteredTaskSource,
    priority: TaskPriority,
}

struct PoolInner {
    kind: PoolKind,
    id: u64,
    label: String,
    params: WorkerPoolParams,
    tracker: Arc<TaskTracker>,
    state: Mutex<PoolState>,
    work_available: Condvar,
    counters: PoolCounters,
    delegate: RwLock<Option<Weak<dyn WorkerPoolDelegate>>>,
}

/// A pool of worker threads running task sources.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool. No thread runs until [`Self::start`]; sources pushed
    /// before that wait in the queue.
    #[must_use]
    pub fn new(
        kind: PoolKind,
        label: impl Into<String>,
        params: WorkerPoolParams,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind,
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                params,
                tracker,
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                counters: PoolCounters::default(),
                delegate: RwLock::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker threads.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyStarted` if the pool was started before
    /// - `SchedulerError::ThreadSpawn` if the OS refused to create a thread
    pub fn start(&self, delegate: Weak<dyn WorkerPoolDelegate>) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }
        *self.inner.delegate.write() = Some(delegate);

        for worker_id in 0..self.inner.params.max_tasks {
            let inner = Arc::clone(&self.inner);
            let mut builder =
                thread::Builder::new().name(format!("{}-{}-{worker_id}", inner.label, inner.kind));
            if let Some(stack_size) = inner.params.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || inner.worker_loop(worker_id))
                .map_err(|e| SchedulerError::ThreadSpawn(e.to_string()))?;
            workers.push(handle);
            self.inner.state.lock().num_workers += 1;
        }

        info!(
            pool = %self.inner.label,
            kind = %self.inner.kind,
            max_tasks = self.inner.params.max_tasks,
            max_best_effort_tasks = self.inner.params.max_best_effort_tasks,
            "WorkerPool started"
        );
        // Sources queued before start.
        self.inner.work_available.notify_all();
        Ok(())
    }

    /// Which pool this is.
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Queue `source` with its current sort key. If it is already queued,
    /// its key is refreshed and the extra registration is dropped.
    pub fn push_task_source(&self, source: RegisteredTaskSource) {
        let key = source.sort_key();
        self.push_task_source_with_key(source, key);
    }

    /// Like [`Self::push_task_source`] with a key computed by the caller.
    pub fn push_task_source_with_key(&self, source: RegisteredTaskSource, key: SortKey) {
        self.inner.push(source, key);
    }

    /// Remove `source` from the ready queue. Returns `None` if it is not
    /// queued, e.g. because a worker is running it.
    pub fn remove_task_source(&self, source: &Arc<dyn TaskSource>) -> Option<RegisteredTaskSource> {
        self.inner.state.lock().queue.remove(source)
    }

    /// Re-key `source` if it is queued. Returns whether it was found.
    pub fn update_sort_key(&self, source: &Arc<dyn TaskSource>, key: SortKey) -> bool {
        self.inner.state.lock().queue.update_sort_key(source, key)
    }

    /// Whether `source` is in the ready queue.
    #[must_use]
    pub fn contains_task_source(&self, source: &Arc<dyn TaskSource>) -> bool {
        self.inner.state.lock().queue.contains(source)
    }

    /// Whether a worker running work of `priority` should yield: the queue
    /// holds higher-priority work and no worker is idle to take it.
    #[must_use]
    pub fn should_yield(&self, priority: TaskPriority) -> bool {
        let state = self.inner.state.lock();
        state.num_idle == 0
            && state
                .queue
                .peek_sort_key()
                .is_some_and(|key| key.priority > priority)
    }

    /// Whether the calling thread is one of this pool's workers.
    #[must_use]
    pub fn is_current_thread_in_pool(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == Some(self.inner.id)
    }

    /// Wake every idle worker, e.g. after a fence was lifted.
    pub fn wake_up_all_workers(&self) {
        self.inner.work_available.notify_all();
    }

    /// Stop the workers once they finish their current task and wait for
    /// them. Sources still queued are dropped.
    pub fn join_for_testing(&self) {
        self.inner.state.lock().join_requested = true;
        self.inner.work_available.notify_all();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let worker_count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                debug!(pool = %self.inner.label, "worker thread panicked");
            }
        }

        let dropped = self.inner.state.lock().queue.drain();
        info!(
            pool = %self.inner.label,
            kind = %self.inner.kind,
            worker_count,
            dropped = dropped.len(),
            "WorkerPool joined"
        );
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        PoolStats {
            worker_count: state.num_workers,
            running_task_sources: state.num_running,
            running_best_effort: state.num_running_best_effort,
            queued_task_sources: state.queue.len(),
            idle_workers: state.num_idle,
            completed_tasks: counters.completed_tasks.load(Ordering::Relaxed),
            panicked_tasks: counters.panicked_tasks.load(Ordering::Relaxed),
            skipped_claims: counters.skipped_claims.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal workers but don't join them here.
        self.inner.state.lock().join_requested = true;
        self.inner.work_available.notify_all();
        debug!(pool = %self.inner.label, "WorkerPool dropped; workers will exit");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn worker_loop(&self, worker_id: usize) {
        CURRENT_POOL.with(|current| current.set(Some(self.id)));
        debug!(pool = %self.label, kind = %self.kind, worker_id, "Worker thread started");

        while let Some(claim) = self.get_work() {
            self.run_claim(claim);
        }

        debug!(pool = %self.label, kind = %self.kind, worker_id, "Worker thread exiting");
    }

    /// Block until a claim is granted or the pool is joined.
    fn get_work(&self) -> Option<Claim> {
        let mut released = Vec::new();
        let mut state = self.state.lock();
        let claim = loop {
            if state.join_requested {
                break None;
            }
            if let Some(claim) = self.take_claim(&mut state, &mut released) {
                break Some(claim);
            }
            if !released.is_empty() {
                // Drop refused sources without the pool lock before waiting.
                drop(state);
                released.clear();
                state = self.state.lock();
                continue;
            }
            state.num_idle += 1;
            self.work_available.wait(&mut state);
            state.num_idle -= 1;
        };
        drop(state);
        drop(released);
        claim
    }

    fn take_claim(
        &self,
        state: &mut PoolState,
        released: &mut Vec<RegisteredTaskSource>,
    ) -> Option<Claim> {
        while let Some(key) = state.queue.peek_sort_key() {
            if !self.tracker.can_run_priority(key.priority) {
                return None;
            }
            let is_best_effort = key.priority == TaskPriority::BestEffort;
            if is_best_effort && state.num_running_best_effort >= self.params.max_best_effort_tasks
            {
                return None;
            }
            let source = Arc::clone(state.queue.peek_source()?);

            let registered = match source.will_run_task() {
                RunStatus::Disallowed => {
                    released.extend(state.queue.pop());
                    continue;
                }
                RunStatus::AllowedSaturated => state.queue.pop()?,
                RunStatus::AllowedNotSaturated => {
                    // The source stays queued for other workers; this worker
                    // carries its own registration.
                    match self.tracker.register_task_source(source) {
                        Some(registered) => {
                            self.work_available.notify_one();
                            registered
                        }
                        None => state.queue.pop()?,
                    }
                }
            };

            state.num_running += 1;
            if is_best_effort {
                state.num_running_best_effort += 1;
            }
            trace!(pool = %self.label, ?key, "claim granted");
            return Some(Claim {
                source: registered,
                priority: key.priority,
            });
        }
        None
    }

    fn run_claim(&self, claim: Claim) {
        let Claim { source, priority } = claim;
        let behavior = source.shutdown_behavior();

        if self.tracker.before_run_task(behavior) {
            let task = source.take_task();
            if self.tracker.run_task(task, &*source) {
                self.counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.panicked_tasks.fetch_add(1, Ordering::Relaxed);
            }
            self.tracker.after_run_task(behavior);

            let must_requeue = source.did_process_task();
            self.release_claim(priority);
            if must_requeue {
                self.re_enqueue(source);
            }
        } else {
            trace!(pool = %self.label, ?behavior, "claim skipped at shutdown");
            source.clear();
            self.counters.skipped_claims.fetch_add(1, Ordering::Relaxed);
            self.release_claim(priority);
        }
    }

    fn release_claim(&self, priority: TaskPriority) {
        let mut state = self.state.lock();
        state.num_running -= 1;
        if priority == TaskPriority::BestEffort {
            state.num_running_best_effort -= 1;
            // A worker may be waiting on the best-effort cap.
            if !state.queue.is_empty() {
                self.work_available.notify_one();
            }
        }
    }

    fn re_enqueue(&self, source: RegisteredTaskSource) {
        let delegate = self.delegate.read().as_ref().and_then(Weak::upgrade);
        let Some(delegate) = delegate else {
            let key = source.sort_key();
            self.push(source, key);
            return;
        };
        let target = delegate.pool_kind_for_traits(source.traits());
        if target != self.kind {
            debug!(from = %self.kind, to = %target, "re-enqueueing in another pool");
            delegate.re_enqueue_changing_pool(source, target);
            return;
        }

        let handle = Arc::clone(source.source());
        let key = source.sort_key();
        self.push(source, key);
        // The priority may have changed while the source was out of the
        // queue; a concurrent update could not move it.
        let target = delegate.pool_kind_for_traits(handle.traits());
        if target != self.kind {
            let moved = self.state.lock().queue.remove(&handle);
            if let Some(registered) = moved {
                debug!(from = %self.kind, to = %target, "re-enqueued source followed its priority");
                delegate.re_enqueue_changing_pool(registered, target);
            }
        }
    }

    fn push(&self, source: RegisteredTaskSource, key: SortKey) {
        let duplicate = {
            let mut state = self.state.lock();
            if state.queue.update_sort_key(source.source(), key) {
                Some(source)
            } else {
                state.queue.push_with_key(source, key);
                None
            }
        };
        if duplicate.is_none() {
            self.work_available.notify_one();
        }
    }
}
