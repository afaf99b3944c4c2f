//! Core scheduling abstractions: task sources, worker pools and the
//! scheduler that routes between them.

pub mod delayed_task_manager;
pub mod error;
pub mod job_task_source;
pub mod post_job;
pub mod priority_queue;
pub mod scheduler;
pub mod sequence;
pub mod task;
pub mod task_runner;
pub mod task_source;
pub mod task_tracker;
pub mod traits;
pub mod worker_pool;

pub use delayed_task_manager::{DelayedTaskManager, PostDelayedCallback};
pub use error::{AppResult, SchedulerError};
pub use job_task_source::{JobTaskSource, MaxConcurrencyCallback, WorkerTask, MAX_TASK_IDS};
pub use post_job::{JobDelegate, JobHandle};
pub use priority_queue::PriorityQueue;
pub use scheduler::{PoolKind, PriorityUpdate, SchedulerDelegate, TaskScheduler};
pub use sequence::{Sequence, SequenceToken, Transaction};
pub use task::{Closure, Task};
pub use task_runner::{ParallelTaskRunner, SequencedTaskRunner, TaskRunner};
pub use task_source::{same_source, ExecutionMode, RunStatus, SortKey, TaskSource};
pub use task_tracker::{RegisteredTaskSource, ShutdownState, TaskTracker};
pub use traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolDelegate};
