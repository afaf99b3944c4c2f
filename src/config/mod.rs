//! Configuration models for the scheduler and its worker pools.

pub mod scheduler;

pub use scheduler::{SchedulerConfig, WorkerPoolParams};
