//! Build and start a [`TaskScheduler`] from configuration.

use tracing::info;

use crate::config::SchedulerConfig;
use crate::core::{SchedulerError, TaskScheduler};

/// Validate `cfg`, create the scheduler and start its threads.
///
/// # Errors
///
/// - `SchedulerError::InvalidConfig` if `cfg` does not validate
/// - `SchedulerError::ThreadSpawn` if a thread could not be created
pub fn build_scheduler(cfg: &SchedulerConfig) -> Result<TaskScheduler, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;

    let scheduler = TaskScheduler::new(cfg.clone())?;
    scheduler.start()?;
    info!(
        label = %cfg.label,
        foreground_workers = cfg.foreground.max_tasks,
        background_workers = cfg.background.as_ref().map_or(0, |p| p.max_tasks),
        "scheduler built"
    );
    Ok(scheduler)
}
