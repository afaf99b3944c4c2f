//! Task runners: posting front-ends bound to a scheduler and a set of
//! traits.
//!
//! Runners hold only a weak reference to the scheduler. Posting through a
//! runner whose scheduler was dropped is a caller bug and panics.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::core::scheduler::{PriorityUpdate, SchedulerInner};
use crate::core::sequence::{Sequence, SequenceToken};
use crate::core::task::{Closure, Task};
use crate::core::task_source::TaskSource;
use crate::core::traits::{TaskPriority, TaskTraits};

/// Posts closures to a scheduler.
pub trait TaskRunner: Send + Sync {
    /// Post `closure` to run after `delay`, recording `posted_from`.
    /// Returns `false` if shutdown refused the task.
    fn post_delayed_task_from(
        &self,
        posted_from: &'static Location<'static>,
        closure: Closure,
        delay: Duration,
    ) -> bool;

    /// Whether the calling thread is currently running a task posted
    /// through this runner.
    fn runs_tasks_in_current_sequence(&self) -> bool;

    /// Post `f` to run as soon as possible.
    #[track_caller]
    fn post_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.post_delayed_task_from(Location::caller(), Box::new(f), Duration::ZERO)
    }

    /// Post `f` to run once `delay` has elapsed.
    #[track_caller]
    fn post_delayed_task<F>(&self, f: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.post_delayed_task_from(Location::caller(), Box::new(f), delay)
    }
}

fn upgrade(scheduler: &Weak<SchedulerInner>, posted_from: &Location<'_>) -> Arc<SchedulerInner> {
    let Some(scheduler) = scheduler.upgrade() else {
        panic!("task posted from {posted_from} after its scheduler was destroyed");
    };
    scheduler
}

/// Runs each posted task as an independent, unordered task source.
pub struct ParallelTaskRunner {
    scheduler: Weak<SchedulerInner>,
    traits: TaskTraits,
}

impl ParallelTaskRunner {
    pub(crate) const fn new(scheduler: Weak<SchedulerInner>, traits: TaskTraits) -> Self {
        Self { scheduler, traits }
    }

    /// Traits of every task posted through this runner.
    #[must_use]
    pub const fn traits(&self) -> TaskTraits {
        self.traits
    }
}

impl TaskRunner for ParallelTaskRunner {
    fn post_delayed_task_from(
        &self,
        posted_from: &'static Location<'static>,
        closure: Closure,
        delay: Duration,
    ) -> bool {
        let scheduler = upgrade(&self.scheduler, posted_from);
        scheduler.post_task_with_sequence(
            Task::from_location(posted_from, closure, delay),
            Sequence::new_parallel(self.traits),
        )
    }

    /// True on any worker of the pool this runner's tasks go to.
    fn runs_tasks_in_current_sequence(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|scheduler| scheduler.is_running_pool_with_traits(self.traits))
    }
}

impl fmt::Debug for ParallelTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelTaskRunner")
            .field("traits", &self.traits)
            .finish_non_exhaustive()
    }
}

/// Runs posted tasks one at a time, in posting order.
pub struct SequencedTaskRunner {
    scheduler: Weak<SchedulerInner>,
    sequence: Arc<Sequence>,
}

impl SequencedTaskRunner {
    pub(crate) fn new(scheduler: Weak<SchedulerInner>, traits: TaskTraits) -> Arc<Self> {
        Arc::new_cyclic(|runner| Self {
            scheduler,
            sequence: Arc::new(Sequence::with_task_runner(traits, runner.clone())),
        })
    }

    /// The sequence tasks are posted into.
    #[must_use]
    pub const fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    /// Token of the underlying sequence.
    #[must_use]
    pub fn token(&self) -> SequenceToken {
        self.sequence.token()
    }

    /// Current traits of the underlying sequence.
    #[must_use]
    pub fn traits(&self) -> TaskTraits {
        self.sequence.traits()
    }

    /// Change the priority of the sequence, moving it between pools if
    /// needed.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was destroyed.
    #[track_caller]
    pub fn update_priority(&self, priority: TaskPriority) -> PriorityUpdate {
        upgrade(&self.scheduler, Location::caller())
            .update_sequence_priority(&self.sequence, priority)
    }
}

impl TaskRunner for SequencedTaskRunner {
    fn post_delayed_task_from(
        &self,
        posted_from: &'static Location<'static>,
        closure: Closure,
        delay: Duration,
    ) -> bool {
        let scheduler = upgrade(&self.scheduler, posted_from);
        scheduler.post_task_with_sequence(
            Task::from_location(posted_from, closure, delay),
            Arc::clone(&self.sequence),
        )
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        SequenceToken::current() == Some(self.sequence.token())
    }
}

impl fmt::Debug for SequencedTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencedTaskRunner")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
