//! Task source for a job run by a variable number of concurrent workers.
//!
//! Worker count and cancellation live in one packed atomic word. Writers only
//! modify it while holding the worker lock; readers on advisory fast paths
//! (`should_yield`, the join fast path) may load it without the lock.
//!
//! The joining thread counts as one worker while it participates. When it
//! has to wait for a slot, it raises the join flag:
//!
//! | from                       | event                          | to                         |
//! |----------------------------|--------------------------------|----------------------------|
//! | `NotWaiting`               | joiner starts waiting          | `WaitingForWorkerToYield`  |
//! | `WaitingForWorkerToYield`  | a worker's `should_yield()`    | `WaitingForWorkerToSignal` |
//! | `WaitingForWorkerToYield`  | worker returns / concurrency ↑ | `NotWaiting` + signal      |
//! | `WaitingForWorkerToSignal` | worker returns / concurrency ↑ | `NotWaiting` + signal      |
//! | any                        | joiner resumes                 | `NotWaiting`               |

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::core::post_job::JobDelegate;
use crate::core::scheduler::SchedulerDelegate;
use crate::core::task::Task;
use crate::core::task_source::{ExecutionMode, RunStatus, SortKey, TaskSource};
use crate::core::traits::{TaskPriority, TaskTraits};

/// Upper bound on concurrently assigned task ids, and thus on workers that
/// ask for one.
pub const MAX_TASK_IDS: u32 = u32::BITS;

/// Closure run by every worker of a job.
pub type WorkerTask = Box<dyn Fn(&JobDelegate<'_>) + Send + Sync>;

/// Callback returning how many workers the job could use, given the number
/// of workers currently running it.
pub type MaxConcurrencyCallback = Box<dyn Fn(usize) -> usize + Send + Sync>;

const CANCELED_MASK: u32 = 1;
const WORKER_COUNT_SHIFT: u32 = 1;
const WORKER_COUNT_INCREMENT: u32 = 1 << WORKER_COUNT_SHIFT;

/// Snapshot of the packed job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobState(u32);

impl JobState {
    const fn is_canceled(self) -> bool {
        self.0 & CANCELED_MASK != 0
    }

    const fn worker_count(self) -> usize {
        (self.0 >> WORKER_COUNT_SHIFT) as usize
    }
}

/// `{canceled: 1 bit, worker_count: 31 bits}`.
#[derive(Debug, Default)]
struct AtomicJobState(AtomicU32);

impl AtomicJobState {
    fn load(&self) -> JobState {
        JobState(self.0.load(Ordering::Acquire))
    }

    /// Returns the state before the change.
    fn cancel(&self) -> JobState {
        JobState(self.0.fetch_or(CANCELED_MASK, Ordering::AcqRel))
    }

    /// Returns the state before the change.
    fn increment_worker_count(&self) -> JobState {
        JobState(self.0.fetch_add(WORKER_COUNT_INCREMENT, Ordering::AcqRel))
    }

    /// Returns the state before the change.
    fn decrement_worker_count(&self) -> JobState {
        let before = JobState(self.0.fetch_sub(WORKER_COUNT_INCREMENT, Ordering::AcqRel));
        debug_assert!(before.worker_count() > 0, "worker count underflow");
        before
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    NotWaiting = 0,
    WaitingForWorkerToYield = 1,
    WaitingForWorkerToSignal = 2,
}

#[derive(Debug)]
struct JoinFlag(AtomicU8);

impl JoinFlag {
    const fn new() -> Self {
        Self(AtomicU8::new(JoinState::NotWaiting as u8))
    }

    fn reset(&self) {
        self.0.store(JoinState::NotWaiting as u8, Ordering::Relaxed);
    }

    fn set_waiting(&self) {
        self.0
            .store(JoinState::WaitingForWorkerToYield as u8, Ordering::Relaxed);
    }

    /// True for exactly one worker per wait.
    fn should_worker_yield(&self) -> bool {
        self.0
            .compare_exchange(
                JoinState::WaitingForWorkerToYield as u8,
                JoinState::WaitingForWorkerToSignal as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// True if the joiner is waiting and must be signaled. Must be called
    /// with the worker lock held.
    fn should_worker_signal(&self) -> bool {
        self.0.swap(JoinState::NotWaiting as u8, Ordering::Relaxed) != JoinState::NotWaiting as u8
    }
}

/// A job: one worker closure run concurrently by up to
/// `max_concurrency(worker_count)` workers.
pub struct JobTaskSource {
    weak_self: Weak<Self>,
    posted_from: &'static Location<'static>,
    ready_time: Instant,
    traits: Mutex<TaskTraits>,
    state: AtomicJobState,
    join_flag: JoinFlag,
    worker_lock: Mutex<()>,
    worker_released: Condvar,
    assigned_task_ids: AtomicU32,
    increase_version: AtomicU64,
    worker_task: WorkerTask,
    max_concurrency: MaxConcurrencyCallback,
    delegate: Option<Weak<dyn SchedulerDelegate>>,
}

impl JobTaskSource {
    /// Create a job.
    ///
    /// `max_concurrency` is called with the worker lock held and must not
    /// call back into the job.
    pub fn new<W, M>(
        posted_from: &'static Location<'static>,
        traits: TaskTraits,
        worker_task: W,
        max_concurrency: M,
        delegate: Option<Weak<dyn SchedulerDelegate>>,
    ) -> Arc<Self>
    where
        W: Fn(&JobDelegate<'_>) + Send + Sync + 'static,
        M: Fn(usize) -> usize + Send + Sync + 'static,
    {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            posted_from,
            ready_time: Instant::now(),
            traits: Mutex::new(traits),
            state: AtomicJobState::default(),
            join_flag: JoinFlag::new(),
            worker_lock: Mutex::new(()),
            worker_released: Condvar::new(),
            assigned_task_ids: AtomicU32::new(0),
            increase_version: AtomicU64::new(0),
            worker_task: Box::new(worker_task),
            max_concurrency: Box::new(max_concurrency),
            delegate,
        })
    }

    /// Where the job was posted from.
    #[must_use]
    pub const fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// Number of workers currently running the job, the joiner included.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.state.load().worker_count()
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.load().is_canceled()
    }

    /// Current maximum concurrency, given the current worker count.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency_for(self.state.load().worker_count())
    }

    fn max_concurrency_for(&self, worker_count: usize) -> usize {
        (self.max_concurrency)(worker_count)
    }

    /// Whether the job still has work or running workers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let _guard = self.worker_lock.lock();
        let state = self.state.load();
        state.worker_count() != 0
            || (!state.is_canceled() && self.max_concurrency_for(state.worker_count()) != 0)
    }

    /// Deny every future claim. Workers already running finish their current
    /// invocation.
    pub fn cancel(&self) {
        let before = self.state.cancel();
        if !before.is_canceled() {
            debug!(posted_from = %self.posted_from, "job canceled");
        }
    }

    /// Let the calling thread participate as a worker. Blocks until a slot
    /// is available or the job is exhausted; returns `false` in the latter
    /// case, after which the caller must not run the worker closure.
    pub fn will_join(&self) -> bool {
        let guard = self.worker_lock.lock();
        let before = self.state.increment_worker_count();
        if !before.is_canceled()
            && before.worker_count() < self.max_concurrency_for(before.worker_count())
        {
            return true;
        }
        self.wait_for_participation_opportunity(guard)
    }

    /// Run the worker closure on the joining thread, then wait for the next
    /// participation opportunity. Returns `false` once the joiner is done.
    pub fn run_join_task(&self) -> bool {
        self.run_worker(true);

        // Optimistic lock-free check; the slow path re-checks under the lock.
        let state = self.state.load();
        if !state.is_canceled()
            && state.worker_count() <= self.max_concurrency_for(state.worker_count() - 1)
        {
            return true;
        }
        let guard = self.worker_lock.lock();
        self.wait_for_participation_opportunity(guard)
    }

    fn wait_for_participation_opportunity(&self, mut guard: MutexGuard<'_, ()>) -> bool {
        // `worker_count - 1` excludes the joiner, which is not running.
        let mut state = self.state.load();
        let mut max_concurrency = self.max_concurrency_for(state.worker_count() - 1);

        // Wait until the joiner fits under the limit, or it is the only
        // worker left.
        while !((state.worker_count() <= max_concurrency && !state.is_canceled())
            || state.worker_count() == 1)
        {
            self.join_flag.set_waiting();
            trace!(
                worker_count = state.worker_count(),
                max_concurrency,
                "joiner waiting for a worker slot"
            );
            self.worker_released.wait(&mut guard);
            state = self.state.load();
            max_concurrency = self.max_concurrency_for(state.worker_count() - 1);
        }
        self.join_flag.reset();

        if state.worker_count() <= max_concurrency && !state.is_canceled() {
            return true;
        }

        debug_assert_eq!(state.worker_count(), 1);
        self.state.decrement_worker_count();
        // No user callback may run after the joiner returns.
        self.state.cancel();
        false
    }

    /// Tell the scheduler the job can use more workers. Wakes the joiner if
    /// it is waiting and makes sure the job is queued.
    pub fn notify_concurrency_increase(&self) {
        self.increase_version.fetch_add(1, Ordering::AcqRel);

        if self.remaining_concurrency() == 0 {
            return;
        }
        {
            let _guard = self.worker_lock.lock();
            if self.join_flag.should_worker_signal() {
                self.worker_released.notify_one();
            }
        }

        if let (Some(delegate), Some(job)) = (self.delegate(), self.weak_self.upgrade()) {
            delegate.enqueue_job_task_source(job);
        }
    }

    /// Whether a running worker should return as soon as possible.
    pub(crate) fn should_yield(&self) -> bool {
        self.join_flag.should_worker_yield() || self.state.load().is_canceled()
    }

    /// Lowest unused task id.
    ///
    /// # Panics
    ///
    /// Panics if all [`MAX_TASK_IDS`] ids are in use.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn acquire_task_id(&self) -> u8 {
        let mut assigned = self.assigned_task_ids.load(Ordering::Relaxed);
        loop {
            let id = assigned.trailing_ones();
            assert!(
                id < MAX_TASK_IDS,
                "job posted from {} uses more than {MAX_TASK_IDS} task ids",
                self.posted_from
            );
            let updated = assigned | (1 << id);
            match self.assigned_task_ids.compare_exchange_weak(
                assigned,
                updated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return id as u8,
                Err(actual) => assigned = actual,
            }
        }
    }

    pub(crate) fn release_task_id(&self, id: u8) {
        let bit = 1_u32 << id;
        let before = self.assigned_task_ids.fetch_and(!bit, Ordering::Release);
        debug_assert!(before & bit != 0, "task id {id} released twice");
    }

    #[cfg(debug_assertions)]
    pub(crate) fn concurrency_increase_version(&self) -> u64 {
        self.increase_version.load(Ordering::Acquire)
    }

    pub(crate) fn delegate(&self) -> Option<Arc<dyn SchedulerDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn run_worker(&self, joining: bool) {
        // The joining thread never yields to other pools.
        let scheduler = if joining { None } else { self.delegate() };
        let delegate = JobDelegate::new(self, scheduler, joining);
        (self.worker_task)(&delegate);
        delegate.assert_expected_concurrency();
    }

    fn release_worker(&self) -> JobState {
        let _guard = self.worker_lock.lock();
        let before = self.state.decrement_worker_count();
        if self.join_flag.should_worker_signal() {
            self.worker_released.notify_one();
        }
        before
    }
}

impl TaskSource for JobTaskSource {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Job
    }

    fn traits(&self) -> TaskTraits {
        *self.traits.lock()
    }

    fn will_run_task(&self) -> RunStatus {
        let _guard = self.worker_lock.lock();
        let before = self.state.load();
        if before.is_canceled() {
            return RunStatus::Disallowed;
        }
        let max_concurrency = self.max_concurrency_for(before.worker_count());
        if before.worker_count() >= max_concurrency {
            return RunStatus::Disallowed;
        }
        self.state.increment_worker_count();
        if before.worker_count() + 1 >= max_concurrency {
            RunStatus::AllowedSaturated
        } else {
            RunStatus::AllowedNotSaturated
        }
    }

    fn take_task(&self) -> Task {
        assert!(
            self.state.load().worker_count() > 0,
            "take_task() without a granted claim"
        );
        let job = self.weak_self.clone();
        Task::from_location(
            self.posted_from,
            Box::new(move || {
                if let Some(job) = job.upgrade() {
                    job.run_worker(false);
                }
            }),
            Duration::ZERO,
        )
    }

    fn did_process_task(&self) -> bool {
        let before = self.release_worker();
        // A canceled job is never re-enqueued.
        if before.is_canceled() {
            return false;
        }
        // `worker_count - 1` excludes the returning worker.
        before.worker_count() <= self.max_concurrency_for(before.worker_count() - 1)
    }

    fn clear(&self) {
        self.cancel();
        self.release_worker();
    }

    fn sort_key(&self) -> SortKey {
        SortKey::new(self.traits.lock().priority, self.ready_time)
    }

    fn remaining_concurrency(&self) -> usize {
        let state = self.state.load();
        if state.is_canceled() {
            return 0;
        }
        self.max_concurrency_for(state.worker_count())
            .saturating_sub(state.worker_count())
    }

    fn update_priority(&self, priority: TaskPriority) {
        self.traits.lock().priority = priority;
    }
}

impl fmt::Debug for JobTaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("JobTaskSource")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("worker_count", &state.worker_count())
            .field("canceled", &state.is_canceled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn job<M>(max_concurrency: M) -> Arc<JobTaskSource>
    where
        M: Fn(usize) -> usize + Send + Sync + 'static,
    {
        JobTaskSource::new(
            Location::caller(),
            TaskTraits::new(),
            |_: &JobDelegate<'_>| {},
            max_concurrency,
            None,
        )
    }

    #[test]
    fn test_packed_state_accessors() {
        let state = AtomicJobState::default();
        assert_eq!(state.load().worker_count(), 0);
        assert!(!state.load().is_canceled());

        state.increment_worker_count();
        state.increment_worker_count();
        let before = state.cancel();
        assert!(!before.is_canceled());
        assert_eq!(before.worker_count(), 2);

        let before = state.decrement_worker_count();
        assert!(before.is_canceled());
        assert_eq!(state.load().worker_count(), 1);
        assert!(state.load().is_canceled());
    }

    #[test]
    fn test_join_flag_transitions() {
        let flag = JoinFlag::new();
        assert!(!flag.should_worker_yield());
        assert!(!flag.should_worker_signal());

        flag.set_waiting();
        assert!(flag.should_worker_yield());
        // Only one worker is asked to yield per wait.
        assert!(!flag.should_worker_yield());
        assert!(flag.should_worker_signal());
        assert!(!flag.should_worker_signal());

        flag.set_waiting();
        flag.reset();
        assert!(!flag.should_worker_yield());
    }

    #[test]
    fn test_will_run_task_saturation() {
        let job = job(|_| 2);
        assert_eq!(job.will_run_task(), RunStatus::AllowedNotSaturated);
        assert_eq!(job.will_run_task(), RunStatus::AllowedSaturated);
        assert_eq!(job.will_run_task(), RunStatus::Disallowed);
        assert_eq!(job.worker_count(), 2);
        assert_eq!(job.remaining_concurrency(), 0);

        assert!(job.did_process_task());
        assert_eq!(job.remaining_concurrency(), 1);
        assert!(job.did_process_task());
        assert_eq!(job.worker_count(), 0);
    }

    #[test]
    fn test_did_process_task_stops_when_work_runs_out() {
        let remaining = Arc::new(AtomicUsize::new(1));
        let remaining_in_cb = Arc::clone(&remaining);
        let job = job(move |_| remaining_in_cb.load(Ordering::SeqCst));

        assert_eq!(job.will_run_task(), RunStatus::AllowedSaturated);
        remaining.store(0, Ordering::SeqCst);
        assert!(!job.did_process_task());
        assert!(!job.is_active());
    }

    #[test]
    fn test_claims_never_exceed_max_concurrency() {
        for max in [1_usize, 2, 8] {
            let job = job(move |_| max);
            let outstanding = Arc::new(AtomicUsize::new(0));
            let high_water = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..max * 2 + 2)
                .map(|_| {
                    let job = Arc::clone(&job);
                    let outstanding = Arc::clone(&outstanding);
                    let high_water = Arc::clone(&high_water);
                    thread::spawn(move || {
                        for _ in 0..200 {
                            if !job.will_run_task().is_allowed() {
                                thread::yield_now();
                                continue;
                            }
                            let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                            high_water.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                            job.did_process_task();
                        }
                    })
                })
                .collect();
            for handle in threads {
                handle.join().unwrap();
            }
            assert!(high_water.load(Ordering::SeqCst) <= max, "max = {max}");
            assert_eq!(job.worker_count(), 0);
        }
    }

    #[test]
    fn test_cancel_denies_future_claims() {
        let job = job(|_| 4);
        assert!(job.will_run_task().is_allowed());

        let stop = Arc::new(AtomicBool::new(false));
        let claimed_after_cancel = Arc::new(AtomicBool::new(false));
        let canceled = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let job = Arc::clone(&job);
                let stop = Arc::clone(&stop);
                let claimed_after_cancel = Arc::clone(&claimed_after_cancel);
                let canceled = Arc::clone(&canceled);
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let was_canceled = canceled.load(Ordering::SeqCst);
                        if job.will_run_task().is_allowed() {
                            if was_canceled {
                                claimed_after_cancel.store(true, Ordering::SeqCst);
                            }
                            job.did_process_task();
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        job.cancel();
        canceled.store(true, Ordering::SeqCst);
        // The in-flight claim completes after cancellation.
        assert!(!job.did_process_task());
        thread::sleep(Duration::from_millis(10));
        stop.store(true, Ordering::SeqCst);
        for handle in threads {
            handle.join().unwrap();
        }

        assert!(!claimed_after_cancel.load(Ordering::SeqCst));
        assert_eq!(job.will_run_task(), RunStatus::Disallowed);
        assert!(!job.will_join());
        assert_eq!(job.remaining_concurrency(), 0);
    }

    #[test]
    fn test_task_ids_lowest_first() {
        let job = job(|_| 1);
        let ids: Vec<u8> = (0..MAX_TASK_IDS).map(|_| job.acquire_task_id()).collect();
        assert_eq!(ids, (0..32).collect::<Vec<u8>>());

        for id in [3_u8, 17, 31, 0] {
            job.release_task_id(id);
        }
        assert_eq!(job.acquire_task_id(), 0);
        assert_eq!(job.acquire_task_id(), 3);
        assert_eq!(job.acquire_task_id(), 17);
        assert_eq!(job.acquire_task_id(), 31);
    }

    #[test]
    #[should_panic(expected = "task ids")]
    fn test_task_id_exhaustion_panics() {
        let job = job(|_| 1);
        for _ in 0..=MAX_TASK_IDS {
            job.acquire_task_id();
        }
    }

    #[test]
    fn test_task_ids_concurrent() {
        let job = job(|_| 1);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let job = Arc::clone(&job);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let id = job.acquire_task_id();
                        assert!(u32::from(id) < MAX_TASK_IDS);
                        job.release_task_id(id);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(job.assigned_task_ids.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_join_alone_runs_until_exhausted() {
        let remaining = Arc::new(AtomicUsize::new(5));
        let remaining_in_worker = Arc::clone(&remaining);
        let remaining_in_cb = Arc::clone(&remaining);
        let job = JobTaskSource::new(
            Location::caller(),
            TaskTraits::new(),
            move |_: &JobDelegate<'_>| {
                remaining_in_worker.fetch_sub(1, Ordering::SeqCst);
            },
            move |_| remaining_in_cb.load(Ordering::SeqCst).min(1),
            None,
        );

        let mut must_run = job.will_join();
        while must_run {
            must_run = job.run_join_task();
        }
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert_eq!(job.worker_count(), 0);
        assert!(job.is_canceled());
    }

    #[test]
    fn test_joiner_waits_for_worker_to_yield() {
        let job = job(|_| 1);
        // A pool worker holds the only slot.
        assert_eq!(job.will_run_task(), RunStatus::AllowedSaturated);

        let joiner_job = Arc::clone(&job);
        let joiner = thread::spawn(move || joiner_job.will_join());

        // The worker is asked to yield exactly once.
        while !job.should_yield() {
            thread::yield_now();
        }
        assert!(!job.join_flag.should_worker_yield());
        // The released slot goes to the joiner, not back to the pool.
        assert!(!job.did_process_task());

        assert!(joiner.join().unwrap());
        assert_eq!(job.worker_count(), 1);
        job.cancel();
        assert!(!job.run_join_task());
        assert_eq!(job.worker_count(), 0);
    }

    #[test]
    fn test_clear_cancels_and_releases_claim() {
        let job = job(|_| 3);
        assert!(job.will_run_task().is_allowed());
        job.clear();
        assert_eq!(job.worker_count(), 0);
        assert!(job.is_canceled());
        assert_eq!(job.will_run_task(), RunStatus::Disallowed);
    }

    #[test]
    fn test_sort_key_follows_priority() {
        let job = job(|_| 1);
        let before = job.sort_key();
        job.update_priority(TaskPriority::UserBlocking);
        let after = job.sort_key();
        assert_eq!(after.priority, TaskPriority::UserBlocking);
        assert_eq!(after.ready_time, before.ready_time);
        assert_eq!(job.execution_mode(), ExecutionMode::Job);
    }
}
