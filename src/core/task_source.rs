//! The schedulable-unit abstraction shared by sequences and jobs.
//!
//! A worker that picks a [`TaskSource`] from a pool must follow the claim
//! protocol:
//!
//! 1. [`TaskSource::will_run_task`]. On [`RunStatus::Disallowed`] the worker
//!    must not touch the source again for this attempt.
//! 2. Exactly one [`TaskSource::take_task`], run the task, then exactly one
//!    [`TaskSource::did_process_task`]; or, instead of both, exactly one
//!    [`TaskSource::clear`].
//!
//! Breaking the protocol is a bug in the caller and panics.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::core::sequence::SequenceToken;
use crate::core::task::Task;
use crate::core::traits::{TaskPriority, TaskTraits};

/// Result of asking a task source for permission to run one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// No additional worker may run this source right now.
    Disallowed,
    /// Claim granted; more workers may still be admitted.
    AllowedNotSaturated,
    /// Claim granted; no further worker should try to join right now.
    AllowedSaturated,
}

impl RunStatus {
    /// Whether the claim was granted.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        !matches!(self, Self::Disallowed)
    }
}

/// How a task source runs its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// A one-shot task with no ordering relative to other tasks.
    Parallel,
    /// Tasks run one at a time in posting order.
    Sequenced,
    /// A job run by a variable number of concurrent workers.
    Job,
}

/// Ordering key of a ready task source within a pool.
///
/// A greater key runs first: higher priority wins, then earlier ready time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey {
    /// Priority of the source.
    pub priority: TaskPriority,
    /// When the source's next unit of work became ready.
    pub ready_time: Instant,
}

impl SortKey {
    /// Create a sort key.
    #[must_use]
    pub const fn new(priority: TaskPriority, ready_time: Instant) -> Self {
        Self {
            priority,
            ready_time,
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // Earlier ready time wins within a priority.
            .then_with(|| other.ready_time.cmp(&self.ready_time))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A unit of schedulable work admitting one or more concurrent worker claims.
pub trait TaskSource: Send + Sync + fmt::Debug {
    /// How this source runs its work.
    fn execution_mode(&self) -> ExecutionMode;

    /// Current traits.
    fn traits(&self) -> TaskTraits;

    /// Ask for permission to run one unit of work.
    fn will_run_task(&self) -> RunStatus;

    /// Take the next unit of work. Requires a granted claim.
    fn take_task(&self) -> Task;

    /// Release a claim after its task ran. Returns `true` if the source has
    /// more work and should stay scheduled.
    fn did_process_task(&self) -> bool;

    /// Release a claim without running anything and drop the pending work.
    fn clear(&self);

    /// Key used to order this source in a pool's ready queue.
    ///
    /// # Panics
    ///
    /// Panics if the source has no pending work.
    fn sort_key(&self) -> SortKey;

    /// How many more workers could usefully run this source right now.
    fn remaining_concurrency(&self) -> usize;

    /// Change the priority in place. Does not move the source between pools.
    fn update_priority(&self, priority: TaskPriority);

    /// Token of the sequence whose tasks this source runs, if any.
    fn sequence_token(&self) -> Option<SequenceToken> {
        None
    }
}

/// Whether two handles refer to the same task source object.
#[must_use]
pub fn same_source(a: &Arc<dyn TaskSource>, b: &Arc<dyn TaskSource>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_status_is_allowed() {
        assert!(!RunStatus::Disallowed.is_allowed());
        assert!(RunStatus::AllowedNotSaturated.is_allowed());
        assert!(RunStatus::AllowedSaturated.is_allowed());
    }

    #[test]
    fn test_sort_key_priority_first() {
        let now = Instant::now();
        let later = now + Duration::from_millis(10);
        let high_late = SortKey::new(TaskPriority::UserBlocking, later);
        let low_early = SortKey::new(TaskPriority::BestEffort, now);
        assert!(high_late > low_early);
    }

    #[test]
    fn test_sort_key_fifo_within_priority() {
        let now = Instant::now();
        let later = now + Duration::from_millis(10);
        let early = SortKey::new(TaskPriority::UserVisible, now);
        let late = SortKey::new(TaskPriority::UserVisible, later);
        assert!(early > late);
        assert_eq!(early.cmp(&early), Ordering::Equal);
    }
}
