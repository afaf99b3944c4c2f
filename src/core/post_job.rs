//! Handles given to job workers ([`JobDelegate`]) and to job submitters
//! ([`JobHandle`]).

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::core::job_task_source::JobTaskSource;
use crate::core::scheduler::SchedulerDelegate;
use crate::core::task_source::TaskSource;
use crate::core::traits::TaskPriority;

/// Passed to every invocation of a job's worker closure.
pub struct JobDelegate<'a> {
    job: &'a JobTaskSource,
    scheduler: Option<Arc<dyn SchedulerDelegate>>,
    joining: bool,
    task_id: Cell<Option<u8>>,
    #[cfg(debug_assertions)]
    last_should_yield: Cell<bool>,
    #[cfg(debug_assertions)]
    recorded_increase_version: u64,
    #[cfg(debug_assertions)]
    recorded_max_concurrency: usize,
}

impl<'a> JobDelegate<'a> {
    pub(crate) fn new(
        job: &'a JobTaskSource,
        scheduler: Option<Arc<dyn SchedulerDelegate>>,
        joining: bool,
    ) -> Self {
        Self {
            job,
            scheduler,
            joining,
            task_id: Cell::new(None),
            #[cfg(debug_assertions)]
            last_should_yield: Cell::new(false),
            #[cfg(debug_assertions)]
            recorded_increase_version: job.concurrency_increase_version(),
            #[cfg(debug_assertions)]
            recorded_max_concurrency: job.max_concurrency(),
        }
    }

    /// Whether the worker should return as soon as possible: the job was
    /// canceled, the joining thread needs a slot, or the scheduler has more
    /// important work for this thread.
    pub fn should_yield(&self) -> bool {
        let should_yield = self.job.should_yield()
            || self
                .scheduler
                .as_ref()
                .is_some_and(|scheduler| scheduler.should_yield(self.job));
        #[cfg(debug_assertions)]
        self.last_should_yield.set(should_yield);
        should_yield
    }

    /// Report that the job can now use more workers than before.
    pub fn notify_concurrency_increase(&self) {
        self.job.notify_concurrency_increase();
    }

    /// Small id, unique among the job's concurrently running workers, in
    /// `0..MAX_TASK_IDS`. Allocated on first call and released when this
    /// invocation returns.
    pub fn task_id(&self) -> u8 {
        if let Some(id) = self.task_id.get() {
            return id;
        }
        let id = self.job.acquire_task_id();
        self.task_id.set(Some(id));
        id
    }

    /// Whether this invocation runs on the thread that called
    /// [`JobHandle::join`].
    pub const fn is_joining_thread(&self) -> bool {
        self.joining
    }

    /// Checks that a worker which returned without being asked to yield
    /// did not leave the job wanting more concurrency than before, unless it
    /// called [`Self::notify_concurrency_increase`].
    pub(crate) fn assert_expected_concurrency(&self) {
        #[cfg(debug_assertions)]
        {
            if self.last_should_yield.get()
                || self.job.concurrency_increase_version() != self.recorded_increase_version
            {
                return;
            }
            let max_concurrency = self.job.max_concurrency();
            assert!(
                max_concurrency <= self.recorded_max_concurrency,
                "job posted from {} raised its max concurrency from {} to {} without notify_concurrency_increase()",
                self.job.posted_from(),
                self.recorded_max_concurrency,
                max_concurrency
            );
        }
    }
}

impl Drop for JobDelegate<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.task_id.get() {
            self.job.release_task_id(id);
        }
    }
}

impl fmt::Debug for JobDelegate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDelegate")
            .field("job", &self.job)
            .field("joining", &self.joining)
            .field("task_id", &self.task_id.get())
            .finish_non_exhaustive()
    }
}

/// Submitter-side handle to a posted job.
///
/// Dropping the handle detaches it: the job keeps running until its max
/// concurrency drops to zero.
#[derive(Default)]
pub struct JobHandle {
    source: Option<Arc<JobTaskSource>>,
}

impl JobHandle {
    pub(crate) const fn new(source: Arc<JobTaskSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// A handle that refers to no job, returned when a post is refused.
    #[must_use]
    pub const fn invalid() -> Self {
        Self { source: None }
    }

    /// Whether the handle refers to a job.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.source.is_some()
    }

    /// Whether the job still has work or running workers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.source.as_ref().is_some_and(|source| source.is_active())
    }

    /// The underlying job, if any.
    #[must_use]
    pub const fn task_source(&self) -> Option<&Arc<JobTaskSource>> {
        self.source.as_ref()
    }

    /// Contribute the calling thread as a worker and block until the job is
    /// done or canceled. The job is unscheduled afterwards.
    pub fn join(mut self) {
        let Some(source) = self.source.take() else {
            debug!("join() on an invalid job handle");
            return;
        };
        debug!(posted_from = %source.posted_from(), "joining job");
        let mut must_run = source.will_join();
        while must_run {
            must_run = source.run_join_task();
        }
        if let Some(delegate) = source.delegate() {
            delegate.remove_job_task_source(&source);
        }
    }

    /// Cancel the job and wait for the workers already running it to return.
    pub fn cancel(mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        source.cancel();
        let must_run = source.will_join();
        debug_assert!(!must_run, "a canceled job admitted its joiner");
        if let Some(delegate) = source.delegate() {
            delegate.remove_job_task_source(&source);
        }
    }

    /// Cancel the job without waiting for running workers.
    pub fn cancel_and_detach(mut self) {
        if let Some(source) = self.source.take() {
            source.cancel();
        }
    }

    /// Change the job's priority, moving it to another pool if needed.
    pub fn update_priority(&self, priority: TaskPriority) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        match source.delegate() {
            Some(delegate) => {
                delegate.update_job_priority(source, priority);
            }
            None => TaskSource::update_priority(source.as_ref(), priority),
        }
    }

    /// Report that the job can now use more workers than before.
    pub fn notify_concurrency_increase(&self) {
        if let Some(source) = self.source.as_ref() {
            source.notify_concurrency_increase();
        }
    }

    /// Let the job run to completion without this handle.
    pub fn detach(mut self) {
        self.source = None;
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            debug!(posted_from = %source.posted_from(), "job handle dropped; detaching");
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::TaskTraits;
    use std::panic::Location;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn standalone_job<W, M>(worker: W, max_concurrency: M) -> Arc<JobTaskSource>
    where
        W: Fn(&JobDelegate<'_>) + Send + Sync + 'static,
        M: Fn(usize) -> usize + Send + Sync + 'static,
    {
        JobTaskSource::new(Location::caller(), TaskTraits::new(), worker, max_concurrency, None)
    }

    #[test]
    fn test_task_id_is_lazy_and_released() {
        let job = standalone_job(|_| {}, |_| 1);
        {
            let delegate = JobDelegate::new(&job, None, false);
            assert_eq!(delegate.task_id(), 0);
            assert_eq!(delegate.task_id(), 0);
            let other = JobDelegate::new(&job, None, false);
            assert_eq!(other.task_id(), 1);
        }
        let delegate = JobDelegate::new(&job, None, false);
        assert_eq!(delegate.task_id(), 0);
    }

    /// Job whose limit is `min(remaining, cap)`. Its worker takes one unit
    /// and raises the cap to 5 on the first run, notifying only if asked to.
    fn raising_job(notify: bool) -> (Arc<JobTaskSource>, Arc<AtomicUsize>) {
        let remaining = Arc::new(AtomicUsize::new(3));
        let cap = Arc::new(AtomicUsize::new(1));
        let work = Arc::clone(&remaining);
        let raised = Arc::clone(&cap);
        let left = Arc::clone(&remaining);
        let limit = Arc::clone(&cap);
        let job = standalone_job(
            move |delegate| {
                let _ = work.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                if raised.swap(5, Ordering::SeqCst) == 1 && notify {
                    delegate.notify_concurrency_increase();
                }
            },
            move |_| left.load(Ordering::SeqCst).min(limit.load(Ordering::SeqCst)),
        );
        (job, remaining)
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without notify_concurrency_increase")]
    fn test_raising_concurrency_silently_panics_in_debug() {
        let (job, _remaining) = raising_job(false);
        JobHandle::new(job).join();
    }

    #[test]
    fn test_raising_concurrency_with_notify_is_accepted() {
        let (job, remaining) = raising_job(true);
        JobHandle::new(Arc::clone(&job)).join();
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert!(!job.is_active());
    }

    #[test]
    fn test_lowering_or_yielding_passes_concurrency_check() {
        let cap = Arc::new(AtomicUsize::new(2));
        let limit = Arc::clone(&cap);
        let job = standalone_job(|_| {}, move |_| limit.load(Ordering::SeqCst));

        let delegate = JobDelegate::new(&job, None, true);
        cap.store(1, Ordering::SeqCst);
        delegate.assert_expected_concurrency();

        // A worker that was told to yield may leave more work behind.
        let delegate = JobDelegate::new(&job, None, true);
        job.cancel();
        assert!(delegate.should_yield());
        cap.store(8, Ordering::SeqCst);
        delegate.assert_expected_concurrency();
    }

    #[test]
    fn test_should_yield_after_cancel() {
        let job = standalone_job(|_| {}, |_| 1);
        let delegate = JobDelegate::new(&job, None, true);
        assert!(!delegate.should_yield());
        assert!(delegate.is_joining_thread());
        job.cancel();
        assert!(delegate.should_yield());
    }

    #[test]
    fn test_join_runs_job_on_calling_thread() {
        let remaining = Arc::new(AtomicUsize::new(5));
        let joined_on = Arc::new(Mutex::new(Vec::new()));
        let worker_remaining = Arc::clone(&remaining);
        let worker_threads = Arc::clone(&joined_on);
        let cb_remaining = Arc::clone(&remaining);
        let job = standalone_job(
            move |delegate| {
                worker_threads
                    .lock()
                    .unwrap()
                    .push(delegate.is_joining_thread());
                worker_remaining.fetch_sub(1, Ordering::SeqCst);
            },
            move |_| cb_remaining.load(Ordering::SeqCst).min(2),
        );

        let handle = JobHandle::new(Arc::clone(&job));
        assert!(handle.is_valid());
        assert!(handle.is_active());
        handle.join();

        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert!(joined_on.lock().unwrap().iter().all(|joining| *joining));
        assert!(!job.is_active());
    }

    #[test]
    fn test_cancel_stops_future_claims() {
        let job = standalone_job(|_| {}, |_| 4);
        let handle = JobHandle::new(Arc::clone(&job));
        handle.cancel();
        assert!(job.is_canceled());
        assert!(!job.will_run_task().is_allowed());
        assert_eq!(job.worker_count(), 0);
    }

    #[test]
    fn test_invalid_handle_is_inert() {
        let handle = JobHandle::invalid();
        assert!(!handle.is_valid());
        assert!(!handle.is_active());
        handle.update_priority(TaskPriority::UserBlocking);
        handle.notify_concurrency_increase();
        handle.join();
        JobHandle::default().cancel();
    }

    #[test]
    fn test_update_priority_without_scheduler() {
        let job = standalone_job(|_| {}, |_| 1);
        let handle = JobHandle::new(Arc::clone(&job));
        handle.update_priority(TaskPriority::BestEffort);
        assert_eq!(job.traits().priority, TaskPriority::BestEffort);
        handle.cancel_and_detach();
        assert!(job.is_canceled());
    }
}
