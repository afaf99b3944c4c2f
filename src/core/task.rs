//! A unit of work: a closure plus the location it was posted from.

use std::fmt;
use std::panic::Location;
use std::time::{Duration, Instant};

/// Boxed closure run by a [`Task`].
pub type Closure = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work owned by whichever task source currently holds it.
///
/// Ownership moves to the worker that takes it and the closure is consumed
/// when it runs.
pub struct Task {
    closure: Closure,
    /// Where the task was posted from.
    pub posted_from: &'static Location<'static>,
    /// Delay requested at post time. Zero for immediate tasks.
    pub delay: Duration,
    queue_time: Instant,
}

impl Task {
    /// Create an immediate task posted from the caller's location.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_location(Location::caller(), Box::new(f), Duration::ZERO)
    }

    /// Create a delayed task posted from the caller's location.
    #[track_caller]
    pub fn with_delay<F>(f: F, delay: Duration) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_location(Location::caller(), Box::new(f), delay)
    }

    /// Create a task with an explicit posted-from location.
    #[must_use]
    pub fn from_location(
        posted_from: &'static Location<'static>,
        closure: Closure,
        delay: Duration,
    ) -> Self {
        Self {
            closure,
            posted_from,
            delay,
            queue_time: Instant::now(),
        }
    }

    /// Time at which the task became ready (or was created, before it was
    /// pushed into a sequence).
    #[must_use]
    pub const fn queue_time(&self) -> Instant {
        self.queue_time
    }

    /// Earliest time the task may run.
    #[must_use]
    pub fn delayed_run_time(&self) -> Instant {
        self.queue_time + self.delay
    }

    /// Whether the task was posted with a non-zero delay.
    #[must_use]
    pub const fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    pub(crate) fn mark_ready(&mut self, now: Instant) {
        self.queue_time = now;
        self.delay = Duration::ZERO;
    }

    pub(crate) fn run(self) {
        (self.closure)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("delay", &self.delay)
            .field("queue_time", &self.queue_time)
            .finish_non_exhaustive()
    }
}
