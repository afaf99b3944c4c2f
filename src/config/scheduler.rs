//! Scheduler and worker pool configuration structures.

use std::env;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::error::AppResult;

/// Prefix of the environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "TASK_SCHEDULER_";

/// Sizing of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolParams {
    /// Number of worker threads, and thus of tasks run concurrently.
    pub max_tasks: usize,
    /// Maximum BEST_EFFORT claims run concurrently.
    pub max_best_effort_tasks: usize,
    /// Stack size of worker threads, in bytes. Platform default if unset.
    #[serde(default)]
    pub thread_stack_size: Option<usize>,
}

impl WorkerPoolParams {
    /// Pool of `max_tasks` workers, all of which may run BEST_EFFORT work.
    #[must_use]
    pub const fn new(max_tasks: usize) -> Self {
        Self {
            max_tasks,
            max_best_effort_tasks: max_tasks,
            thread_stack_size: None,
        }
    }

    /// Set the BEST_EFFORT cap.
    #[must_use]
    pub const fn with_max_best_effort_tasks(mut self, max_best_effort_tasks: usize) -> Self {
        self.max_best_effort_tasks = max_best_effort_tasks;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Validate pool sizing.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tasks == 0 {
            return Err("max_tasks must be greater than 0".into());
        }
        if self.max_best_effort_tasks == 0 {
            return Err("max_best_effort_tasks must be greater than 0".into());
        }
        if self.max_best_effort_tasks > self.max_tasks {
            return Err("max_best_effort_tasks must not exceed max_tasks".into());
        }
        if self.thread_stack_size == Some(0) {
            return Err("thread_stack_size must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Prefix of thread names and log fields.
    pub label: String,
    /// Pool for USER_BLOCKING and USER_VISIBLE work.
    pub foreground: WorkerPoolParams,
    /// Pool for BEST_EFFORT work. Without it, BEST_EFFORT work runs in the
    /// foreground pool under its BEST_EFFORT cap.
    #[serde(default)]
    pub background: Option<WorkerPoolParams>,
}

impl Default for SchedulerConfig {
    /// One foreground worker per CPU (at least two) and a small background
    /// pool.
    fn default() -> Self {
        let cpus = num_cpus::get().max(2);
        Self {
            label: "task-scheduler".to_string(),
            foreground: WorkerPoolParams::new(cpus).with_max_best_effort_tasks(cpus / 2),
            background: Some(WorkerPoolParams::new((cpus / 2).max(1))),
        }
    }
}

impl SchedulerConfig {
    /// Validate the label and every pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.label.trim().is_empty() {
            return Err("label must not be empty".into());
        }
        self.foreground
            .validate()
            .map_err(|e| format!("foreground pool invalid: {e}"))?;
        if let Some(background) = &self.background {
            background
                .validate()
                .map_err(|e| format!("background pool invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Start from [`Self::default`] and apply `TASK_SCHEDULER_*` variables,
    /// loading a `.env` file first if one exists.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `TASK_SCHEDULER_LABEL` | `label` |
    /// | `TASK_SCHEDULER_FOREGROUND_MAX_TASKS` | `foreground.max_tasks` |
    /// | `TASK_SCHEDULER_FOREGROUND_MAX_BEST_EFFORT_TASKS` | `foreground.max_best_effort_tasks` |
    /// | `TASK_SCHEDULER_BACKGROUND_MAX_TASKS` | `background.max_tasks`, `0` disables the pool |
    /// | `TASK_SCHEDULER_BACKGROUND_MAX_BEST_EFFORT_TASKS` | `background.max_best_effort_tasks` |
    /// | `TASK_SCHEDULER_THREAD_STACK_SIZE` | `thread_stack_size` of both pools |
    ///
    /// # Errors
    ///
    /// Fails if a variable does not parse or the result does not validate.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();

        if let Some(label) = read_var::<String>("LABEL")? {
            cfg.label = label;
        }
        if let Some(max_tasks) = read_var("FOREGROUND_MAX_TASKS")? {
            cfg.foreground.max_tasks = max_tasks;
            cfg.foreground.max_best_effort_tasks =
                cfg.foreground.max_best_effort_tasks.min(max_tasks);
        }
        if let Some(cap) = read_var("FOREGROUND_MAX_BEST_EFFORT_TASKS")? {
            cfg.foreground.max_best_effort_tasks = cap;
        }
        match read_var::<usize>("BACKGROUND_MAX_TASKS")? {
            Some(0) => cfg.background = None,
            Some(max_tasks) => cfg.background = Some(WorkerPoolParams::new(max_tasks)),
            None => {}
        }
        if let Some(cap) = read_var("BACKGROUND_MAX_BEST_EFFORT_TASKS")? {
            if let Some(background) = cfg.background.as_mut() {
                background.max_best_effort_tasks = cap;
            }
        }
        if let Some(bytes) = read_var("THREAD_STACK_SIZE")? {
            cfg.foreground.thread_stack_size = Some(bytes);
            if let Some(background) = cfg.background.as_mut() {
                background.thread_stack_size = Some(bytes);
            }
        }

        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("invalid scheduler configuration from environment")?;
        Ok(cfg)
    }
}

fn read_var<T>(suffix: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{ENV_PREFIX}{suffix}");
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("failed to parse {name}={raw:?}")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {name}")),
    }
}
