//! The scheduler: routes task sources to worker pools by traits, defers
//! delayed tasks and moves task sources between pools when their priority
//! changes.
//!
//! # Example
//!
//! ```no_run
//! use prometheus_task_scheduler::{SchedulerConfig, TaskRunner, TaskScheduler, TaskTraits};
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default())?;
//! scheduler.start()?;
//!
//! let runner = scheduler.create_sequenced_task_runner_with_traits(TaskTraits::new());
//! runner.post_task(|| println!("first"));
//! runner.post_task(|| println!("second"));
//!
//! scheduler.flush_for_testing();
//! scheduler.shutdown();
//! # Ok::<(), prometheus_task_scheduler::SchedulerError>(())
//! ```

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, trace};

use crate::config::SchedulerConfig;
use crate::core::delayed_task_manager::DelayedTaskManager;
use crate::core::error::SchedulerError;
use crate::core::job_task_source::JobTaskSource;
use crate::core::post_job::{JobDelegate, JobHandle};
use crate::core::sequence::Sequence;
use crate::core::task::Task;
use crate::core::task_runner::{ParallelTaskRunner, SequencedTaskRunner};
use crate::core::task_source::{SortKey, TaskSource};
use crate::core::task_tracker::{RegisteredTaskSource, TaskTracker};
use crate::core::traits::{TaskPriority, TaskTraits, ThreadPolicy};
use crate::core::worker_pool::{PoolStats, WorkerPool, WorkerPoolDelegate};

pub use crate::core::worker_pool::PoolKind;

/// Scheduler services used by jobs and their handles.
pub trait SchedulerDelegate: Send + Sync {
    /// Queue `job` in the pool matching its traits, if it is not already
    /// queued. Returns `false` if shutdown refused it.
    fn enqueue_job_task_source(&self, job: Arc<JobTaskSource>) -> bool;

    /// Take `job` out of every ready queue.
    fn remove_job_task_source(&self, job: &Arc<JobTaskSource>);

    /// Whether a worker running `source` on the calling thread should yield.
    fn should_yield(&self, source: &dyn TaskSource) -> bool;

    /// Change the priority of `job`, moving it to another pool if needed.
    fn update_job_priority(&self, job: &Arc<JobTaskSource>, priority: TaskPriority)
        -> PriorityUpdate;
}

/// Outcome of a priority update.
///
/// Losing the race against a worker is not an error: a source that is
/// running picks up its new priority and pool when it is re-enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityUpdate {
    /// Re-sorted in place in its current pool.
    Resorted(PoolKind),
    /// Removed from one pool's queue and pushed into the other's.
    Moved {
        /// Pool it left.
        from: PoolKind,
        /// Pool it joined.
        to: PoolKind,
    },
    /// Not in a ready queue (running, empty or never queued).
    NotQueued,
}

/// Thread-pool task scheduler. Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    label: String,
    weak_self: Weak<SchedulerInner>,
    tracker: Arc<TaskTracker>,
    foreground: WorkerPool,
    background: Option<WorkerPool>,
    delayed: DelayedTaskManager,
    started: AtomicBool,
}

impl TaskScheduler {
    /// Create a scheduler. Work can be posted right away; it runs once
    /// [`Self::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if `config` does not validate.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let tracker = Arc::new(TaskTracker::new());
        let SchedulerConfig {
            label,
            foreground,
            background,
        } = config;

        let inner = Arc::new_cyclic(|weak_self| SchedulerInner {
            foreground: WorkerPool::new(
                PoolKind::Foreground,
                label.clone(),
                foreground,
                Arc::clone(&tracker),
            ),
            background: background.map(|params| {
                WorkerPool::new(PoolKind::Background, label.clone(), params, Arc::clone(&tracker))
            }),
            label,
            weak_self: weak_self.clone(),
            tracker,
            delayed: DelayedTaskManager::new(),
            started: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// Spawn the worker threads and the delayed-task thread.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyStarted` if called twice
    /// - `SchedulerError::ThreadSpawn` if a thread could not be created
    pub fn start(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let pool_delegate: Weak<dyn WorkerPoolDelegate> = inner.weak_self.clone();
        inner.foreground.start(pool_delegate.clone())?;
        if let Some(background) = &inner.background {
            background.start(pool_delegate)?;
        }
        inner.delayed.start(&inner.label)?;
        info!(
            label = %inner.label,
            has_background = inner.background.is_some(),
            "TaskScheduler started"
        );
        Ok(())
    }

    /// Post `task` into `sequence`. Returns `false` if shutdown refused it,
    /// in which case the task is dropped.
    pub fn post_task_with_sequence(&self, task: Task, sequence: Arc<Sequence>) -> bool {
        self.inner.post_task_with_sequence(task, sequence)
    }

    /// Post a one-off parallel task.
    #[track_caller]
    pub fn post_task<F>(&self, traits: TaskTraits, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with_sequence(Task::new(f), Sequence::new_parallel(traits))
    }

    /// Pool that task sources with `traits` belong to.
    #[must_use]
    pub fn pool_kind_for_traits(&self, traits: TaskTraits) -> PoolKind {
        WorkerPoolDelegate::pool_kind_for_traits(self.inner.as_ref(), traits)
    }

    /// Change the priority of `sequence` and move it to the matching pool.
    pub fn update_priority(
        &self,
        sequence: &Arc<Sequence>,
        priority: TaskPriority,
    ) -> PriorityUpdate {
        self.inner.update_sequence_priority(sequence, priority)
    }

    /// Post a job run by up to `max_concurrency(worker_count)` concurrent
    /// invocations of `worker_task`. Returns an invalid handle if shutdown
    /// refused the job.
    #[track_caller]
    pub fn post_job<W, M>(
        &self,
        traits: TaskTraits,
        worker_task: W,
        max_concurrency: M,
    ) -> JobHandle
    where
        W: Fn(&JobDelegate<'_>) + Send + Sync + 'static,
        M: Fn(usize) -> usize + Send + Sync + 'static,
    {
        self.inner
            .post_job(Location::caller(), traits, worker_task, max_concurrency)
    }

    /// Task runner posting each task as its own parallel task source.
    #[must_use]
    pub fn create_task_runner_with_traits(&self, traits: TaskTraits) -> Arc<ParallelTaskRunner> {
        Arc::new(ParallelTaskRunner::new(self.inner.weak_self.clone(), traits))
    }

    /// Task runner posting every task into one sequence.
    #[must_use]
    pub fn create_sequenced_task_runner_with_traits(
        &self,
        traits: TaskTraits,
    ) -> Arc<SequencedTaskRunner> {
        SequencedTaskRunner::new(self.inner.weak_self.clone(), traits)
    }

    /// Whether a worker running `source` on the calling thread should yield.
    #[must_use]
    pub fn should_yield(&self, source: &dyn TaskSource) -> bool {
        SchedulerDelegate::should_yield(self.inner.as_ref(), source)
    }

    /// Stop (or resume) handing out any work.
    pub fn set_execution_fence_enabled(&self, enabled: bool) {
        debug!(enabled, "execution fence");
        self.inner.tracker.set_execution_fence_enabled(enabled);
        if !enabled {
            self.inner.wake_up_all_workers();
        }
    }

    /// Stop (or resume) handing out BEST_EFFORT work.
    pub fn set_best_effort_fence_enabled(&self, enabled: bool) {
        debug!(enabled, "best-effort fence");
        self.inner.tracker.set_best_effort_fence_enabled(enabled);
        if !enabled {
            self.inner.wake_up_all_workers();
        }
    }

    /// Refuse new work and block until every BLOCK_SHUTDOWN task and every
    /// running SKIP_ON_SHUTDOWN task has completed.
    pub fn shutdown(&self) {
        info!(label = %self.inner.label, "TaskScheduler shutting down");
        self.inner.tracker.start_shutdown();
        // Fences no longer apply; fenced BLOCK_SHUTDOWN work must drain.
        self.inner.wake_up_all_workers();
        self.inner.tracker.complete_shutdown();
    }

    /// Block until no task source is queued or running. Delayed tasks that
    /// are not due yet are not waited for.
    pub fn flush_for_testing(&self) {
        self.inner.tracker.flush_for_testing();
    }

    /// Stop the delayed-task thread, then join every worker.
    pub fn join_for_testing(&self) {
        // No delayed task may reach a pool that is being joined.
        self.inner.delayed.stop();
        self.inner.foreground.join_for_testing();
        if let Some(background) = &self.inner.background {
            background.join_for_testing();
        }
        info!(label = %self.inner.label, "TaskScheduler joined");
    }

    /// Statistics of the pool of `kind`, if it exists.
    #[must_use]
    pub fn pool_stats(&self, kind: PoolKind) -> Option<PoolStats> {
        self.inner.pool(kind).map(WorkerPool::stats)
    }

    /// Whether queued `source` is in the ready queue of the pool of `kind`.
    #[must_use]
    pub fn pool_contains(&self, kind: PoolKind, source: &Arc<dyn TaskSource>) -> bool {
        self.inner
            .pool(kind)
            .is_some_and(|pool| pool.contains_task_source(source))
    }

    /// The shutdown tracker shared by the pools.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.inner.tracker
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("label", &self.inner.label)
            .field("foreground", &self.inner.foreground)
            .field("background", &self.inner.background)
            .field("tracker", &self.inner.tracker)
            .finish_non_exhaustive()
    }
}

impl SchedulerInner {
    fn pool(&self, kind: PoolKind) -> Option<&WorkerPool> {
        match kind {
            PoolKind::Foreground => Some(&self.foreground),
            PoolKind::Background => self.background.as_ref(),
        }
    }

    fn pool_for_kind(&self, kind: PoolKind) -> &WorkerPool {
        self.pool(kind).unwrap_or(&self.foreground)
    }

    fn pool_for_traits(&self, traits: TaskTraits) -> &WorkerPool {
        self.pool_for_kind(self.pool_kind_for_traits(traits))
    }

    pub(crate) fn is_running_pool_with_traits(&self, traits: TaskTraits) -> bool {
        self.pool_for_traits(traits).is_current_thread_in_pool()
    }

    fn wake_up_all_workers(&self) {
        self.foreground.wake_up_all_workers();
        if let Some(background) = &self.background {
            background.wake_up_all_workers();
        }
    }

    pub(crate) fn post_task_with_sequence(&self, task: Task, sequence: Arc<Sequence>) -> bool {
        let behavior = sequence.traits().shutdown_behavior;
        if !self.tracker.will_post_task(&task, behavior) {
            return false;
        }

        if !task.is_delayed() {
            return self.post_task_with_sequence_now(task, &sequence);
        }

        trace!(posted_from = %task.posted_from, delay = ?task.delay, "delayed task deferred");
        let scheduler = self.weak_self.clone();
        self.delayed.add_delayed_task(
            task,
            Box::new(move |task| {
                let Some(scheduler) = scheduler.upgrade() else {
                    return;
                };
                if scheduler.tracker.can_post_delayed_task_now() {
                    scheduler.post_task_with_sequence_now(task, &sequence);
                } else {
                    debug!(
                        posted_from = %task.posted_from,
                        "delayed task dropped: shutdown has started"
                    );
                }
            }),
        )
    }

    fn post_task_with_sequence_now(&self, task: Task, sequence: &Arc<Sequence>) -> bool {
        let posted_from = task.posted_from;
        let must_schedule = sequence.begin_transaction().push_task(task);
        if !must_schedule {
            // Already queued or running; the worker re-enqueues it.
            return true;
        }

        let source: Arc<dyn TaskSource> = Arc::<Sequence>::clone(sequence);
        let Some(registered) = self.tracker.register_task_source(source) else {
            sequence.clear();
            return false;
        };
        let kind = self.schedule_task_source(registered);
        debug!(
            posted_from = %posted_from,
            pool = %kind,
            token = sequence.token().get(),
            "sequence scheduled"
        );
        true
    }

    /// Push `registered` into the pool of its traits and return that pool.
    fn schedule_task_source(&self, registered: RegisteredTaskSource) -> PoolKind {
        let source = Arc::clone(registered.source());
        let kind = self.pool_kind_for_traits(registered.traits());
        self.pool_for_kind(kind).push_task_source(registered);
        self.follow_priority_change(&source, kind)
    }

    /// A priority update that ran while `source` was being pushed into
    /// `kind` could not find it there. Move it to the pool its traits now
    /// map to, if it is still queued.
    pub(crate) fn follow_priority_change(
        &self,
        source: &Arc<dyn TaskSource>,
        mut kind: PoolKind,
    ) -> PoolKind {
        loop {
            let target = self.pool_kind_for_traits(source.traits());
            if target == kind {
                return kind;
            }
            let Some(registered) = self.pool_for_kind(kind).remove_task_source(source) else {
                return kind;
            };
            debug!(from = %kind, to = %target, "task source followed its priority");
            self.pool_for_kind(target).push_task_source(registered);
            kind = target;
        }
    }

    fn post_job<W, M>(
        &self,
        posted_from: &'static Location<'static>,
        traits: TaskTraits,
        worker_task: W,
        max_concurrency: M,
    ) -> JobHandle
    where
        W: Fn(&JobDelegate<'_>) + Send + Sync + 'static,
        M: Fn(usize) -> usize + Send + Sync + 'static,
    {
        let delegate: Weak<dyn SchedulerDelegate> = self.weak_self.clone();
        let job = JobTaskSource::new(
            posted_from,
            traits,
            worker_task,
            max_concurrency,
            Some(delegate),
        );
        if !self.enqueue_job_task_source(Arc::clone(&job)) {
            debug!(posted_from = %posted_from, "job refused");
            return JobHandle::invalid();
        }
        debug!(posted_from = %posted_from, ?traits, "job posted");
        JobHandle::new(job)
    }

    pub(crate) fn update_sequence_priority(
        &self,
        sequence: &Arc<Sequence>,
        priority: TaskPriority,
    ) -> PriorityUpdate {
        let (old_traits, new_traits, key) = {
            let mut txn = sequence.begin_transaction();
            let old_traits = txn.traits();
            txn.update_priority(priority);
            let key = (!txn.is_empty()).then(|| txn.sort_key());
            (old_traits, txn.traits(), key)
        };
        let source: Arc<dyn TaskSource> = Arc::<Sequence>::clone(sequence);
        self.reroute(&source, old_traits, new_traits, key)
    }

    /// Move `source` to the pool of `new_traits`, or re-sort it in place.
    /// The caller has already released every lock on `source`.
    fn reroute(
        &self,
        source: &Arc<dyn TaskSource>,
        old_traits: TaskTraits,
        new_traits: TaskTraits,
        key: Option<SortKey>,
    ) -> PriorityUpdate {
        let Some(key) = key else {
            return PriorityUpdate::NotQueued;
        };
        let from = self.pool_kind_for_traits(old_traits);
        let to = self.pool_kind_for_traits(new_traits);

        let outcome = if from == to {
            if self.pool_for_kind(from).update_sort_key(source, key) {
                PriorityUpdate::Resorted(from)
            } else {
                PriorityUpdate::NotQueued
            }
        } else {
            match self.pool_for_kind(from).remove_task_source(source) {
                Some(registered) => {
                    self.pool_for_kind(to).push_task_source_with_key(registered, key);
                    PriorityUpdate::Moved { from, to }
                }
                None => PriorityUpdate::NotQueued,
            }
        };
        debug!(?source, priority = ?new_traits.priority, ?outcome, "priority updated");
        outcome
    }
}

impl SchedulerDelegate for SchedulerInner {
    fn enqueue_job_task_source(&self, job: Arc<JobTaskSource>) -> bool {
        let source: Arc<dyn TaskSource> = job;
        let Some(registered) = self.tracker.register_task_source(source) else {
            return false;
        };
        self.schedule_task_source(registered);
        true
    }

    fn remove_job_task_source(&self, job: &Arc<JobTaskSource>) {
        let source: Arc<dyn TaskSource> = Arc::<JobTaskSource>::clone(job);
        drop(self.foreground.remove_task_source(&source));
        if let Some(background) = &self.background {
            drop(background.remove_task_source(&source));
        }
    }

    fn should_yield(&self, source: &dyn TaskSource) -> bool {
        let traits = source.traits();
        let pool = self.pool_for_traits(traits);
        // The source now belongs to another pool: yield so that it moves.
        if !pool.is_current_thread_in_pool() {
            return true;
        }
        if !self.tracker.can_run_priority(traits.priority) {
            return true;
        }
        pool.should_yield(traits.priority)
    }

    fn update_job_priority(
        &self,
        job: &Arc<JobTaskSource>,
        priority: TaskPriority,
    ) -> PriorityUpdate {
        let old_traits = job.traits();
        TaskSource::update_priority(job.as_ref(), priority);
        let new_traits = job.traits();
        let source: Arc<dyn TaskSource> = Arc::<JobTaskSource>::clone(job);
        let key = job.sort_key();
        self.reroute(&source, old_traits, new_traits, Some(key))
    }
}

impl WorkerPoolDelegate for SchedulerInner {
    fn pool_kind_for_traits(&self, traits: TaskTraits) -> PoolKind {
        if traits.priority == TaskPriority::BestEffort
            && traits.thread_policy == ThreadPolicy::PreferBackground
            && self.background.is_some()
        {
            PoolKind::Background
        } else {
            PoolKind::Foreground
        }
    }

    fn re_enqueue_changing_pool(&self, source: RegisteredTaskSource, kind: PoolKind) {
        let handle = Arc::clone(source.source());
        self.pool_for_kind(kind).push_task_source(source);
        self.follow_priority_change(&handle, kind);
    }
}
