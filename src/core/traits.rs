//! Metadata attached to task sources: priority, shutdown behavior, thread policy.

use serde::{Deserialize, Serialize};

/// Priority class of a task source. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Work whose result is not visible to the user (e.g. cache cleanup).
    BestEffort,
    /// Work whose result is visible to the user but not blocking it.
    #[default]
    UserVisible,
    /// Work the user is actively waiting for.
    UserBlocking,
}

impl TaskPriority {
    /// Lowest priority.
    pub const LOWEST: Self = Self::BestEffort;
    /// Highest priority.
    pub const HIGHEST: Self = Self::UserBlocking;
}

/// What happens to a task when shutdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskShutdownBehavior {
    /// Not started tasks are skipped; running tasks are not waited for.
    ContinueOnShutdown,
    /// Not started tasks are skipped; running tasks block shutdown.
    #[default]
    SkipOnShutdown,
    /// Posted tasks run before shutdown completes. Posting is still allowed
    /// between the start and the completion of shutdown.
    BlockShutdown,
}

/// Whether BEST_EFFORT work may be moved to background threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPolicy {
    /// BEST_EFFORT work runs in the background pool when one exists.
    #[default]
    PreferBackground,
    /// Always run in the foreground pool, regardless of priority.
    MustUseForeground,
}

/// Traits of a task source.
///
/// Immutable once attached to a source, except for `priority` which can be
/// changed through an explicit priority update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TaskTraits {
    /// Priority class.
    pub priority: TaskPriority,
    /// Shutdown behavior.
    pub shutdown_behavior: TaskShutdownBehavior,
    /// Thread policy.
    pub thread_policy: ThreadPolicy,
}

impl TaskTraits {
    /// Default traits: USER_VISIBLE, SKIP_ON_SHUTDOWN, prefer background.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            priority: TaskPriority::UserVisible,
            shutdown_behavior: TaskShutdownBehavior::SkipOnShutdown,
            thread_policy: ThreadPolicy::PreferBackground,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the shutdown behavior.
    #[must_use]
    pub const fn with_shutdown_behavior(mut self, behavior: TaskShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self
    }

    /// Set the thread policy.
    #[must_use]
    pub const fn with_thread_policy(mut self, policy: ThreadPolicy) -> Self {
        self.thread_policy = policy;
        self
    }
}

impl From<TaskPriority> for TaskTraits {
    fn from(priority: TaskPriority) -> Self {
        Self::new().with_priority(priority)
    }
}

impl From<TaskShutdownBehavior> for TaskTraits {
    fn from(behavior: TaskShutdownBehavior) -> Self {
        Self::new().with_shutdown_behavior(behavior)
    }
}
