//! # Prometheus Task Scheduler
//!
//! A priority-aware thread-pool task scheduler with ordered sequences and
//! dynamic-concurrency jobs.
//!
//! Work is posted as closures. Each closure lives in a *task source*: a
//! [`Sequence`] runs its tasks one at a time in posting order, a job
//! ([`JobTaskSource`]) runs one worker closure on as many threads as it
//! currently has work for. Worker pools pull task sources from a ready
//! queue ordered by priority, then by the time they became ready.
//!
//! ## Key Features
//!
//! - **Priorities**: `UserBlocking` > `UserVisible` > `BestEffort`, with
//!   BEST_EFFORT work routed to a separate background pool when one exists
//! - **Sequences**: FIFO, never concurrent, re-prioritizable while queued
//! - **Jobs**: `post_job` with a max-concurrency callback, cooperative
//!   `should_yield()`, joining from the posting thread, cancellation
//! - **Delayed tasks**: held by a service thread until due
//! - **Shutdown semantics**: CONTINUE_ON_SHUTDOWN, SKIP_ON_SHUTDOWN and
//!   BLOCK_SHUTDOWN per task source
//! - **Fences**: stop handing out all work or only BEST_EFFORT work
//!
//! ## Sequenced tasks
//!
//! ```rust,no_run
//! use prometheus_task_scheduler::{SchedulerConfig, TaskPriority, TaskRunner, TaskTraits};
//! use prometheus_task_scheduler::builders::build_scheduler;
//!
//! let scheduler = build_scheduler(&SchedulerConfig::default())?;
//! let runner = scheduler
//!     .create_sequenced_task_runner_with_traits(TaskTraits::from(TaskPriority::UserVisible));
//!
//! runner.post_task(|| println!("runs first"));
//! runner.post_task(|| println!("runs second"));
//!
//! scheduler.shutdown();
//! # Ok::<(), prometheus_task_scheduler::SchedulerError>(())
//! ```
//!
//! ## Jobs
//!
//! ```rust,no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use prometheus_task_scheduler::{SchedulerConfig, TaskTraits};
//! use prometheus_task_scheduler::builders::build_scheduler;
//!
//! let scheduler = build_scheduler(&SchedulerConfig::default())?;
//! let remaining = Arc::new(AtomicUsize::new(100));
//! let work = Arc::clone(&remaining);
//! let left = Arc::clone(&remaining);
//!
//! let handle = scheduler.post_job(
//!     TaskTraits::new(),
//!     move |delegate| {
//!         while !delegate.should_yield() {
//!             if work.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
//!                 return;
//!             }
//!         }
//!     },
//!     move |_worker_count| left.load(Ordering::SeqCst),
//! );
//! handle.join();
//! assert_eq!(remaining.load(Ordering::SeqCst), 0);
//! # Ok::<(), prometheus_task_scheduler::SchedulerError>(())
//! ```
//!
//! For complete examples, see:
//! - `tests/task_scheduler_test.rs` - End-to-end scheduling scenarios
//! - `tests/post_job_test.rs` - Job concurrency and cancellation

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: task sources, pools and the scheduler.
pub mod core;
/// Configuration models for the scheduler and its pools.
pub mod config;
/// Builders to construct a running scheduler from configuration.
pub mod builders;
/// Runtime adapters for async callers.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use crate::config::{SchedulerConfig, WorkerPoolParams};
pub use crate::core::{
    JobDelegate, JobHandle, JobTaskSource, PoolKind, PoolStats, PriorityUpdate, SchedulerError,
    Sequence, SequenceToken, Task, TaskPriority, TaskRunner, TaskScheduler, TaskShutdownBehavior,
    TaskSource, TaskTraits, ThreadPolicy,
};
