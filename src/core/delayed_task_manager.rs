//! Holds delayed tasks until their run time, then hands them back to the
//! scheduler.
//!
//! A single service thread owns a min-heap of pending tasks. New tasks reach
//! it over a `crossbeam-channel`; it sleeps with `recv_deadline` until the
//! earliest run time or the next submission, whichever comes first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::core::error::SchedulerError;
use crate::core::task::Task;

/// Called with a delayed task once it is due.
pub type PostDelayedCallback = Box<dyn FnOnce(Task) + Send>;

struct DelayedEntry {
    run_time: Instant,
    seq: u64,
    task: Task,
    callback: PostDelayedCallback,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_time == other.run_time && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest run time on top of the max-heap, FIFO among equals.
        other
            .run_time
            .cmp(&self.run_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedTask {
    task: Task,
    callback: PostDelayedCallback,
}

/// Service thread that fires delayed tasks.
pub struct DelayedTaskManager {
    sender: Mutex<Option<Sender<DelayedTask>>>,
    receiver: Mutex<Option<Receiver<DelayedTask>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedTaskManager {
    /// Create a stopped manager. Tasks added before [`Self::start`] are
    /// buffered in the channel.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the service thread.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyStarted` if called twice
    /// - `SchedulerError::ThreadSpawn` if the thread could not be created
    pub fn start(&self, label: &str) -> Result<(), SchedulerError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;
        let handle = thread::Builder::new()
            .name(format!("{label}-delayed"))
            .spawn(move || service_loop(&receiver))
            .map_err(|e| SchedulerError::ThreadSpawn(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        debug!(label, "DelayedTaskManager started");
        Ok(())
    }

    /// Call `callback` with `task` once its delayed run time is reached.
    /// Returns `false` and drops the task if the manager was stopped.
    pub fn add_delayed_task(&self, task: Task, callback: PostDelayedCallback) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            debug!(posted_from = %task.posted_from, "delayed task dropped: manager stopped");
            return false;
        };
        sender
            .send(DelayedTask { task, callback })
            .is_ok()
    }

    /// Stop the service thread and wait for it. Pending tasks are dropped
    /// without being fired.
    pub fn stop(&self) {
        self.sender.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!("delayed task thread panicked");
            }
        }
    }
}

impl Default for DelayedTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DelayedTaskManager {
    fn drop(&mut self) {
        // Disconnecting the channel ends the service thread.
        self.sender.lock().take();
    }
}

impl fmt::Debug for DelayedTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTaskManager")
            .field("running", &self.thread.lock().is_some())
            .field("stopped", &self.sender.lock().is_none())
            .finish()
    }
}

fn service_loop(receiver: &Receiver<DelayedTask>) {
    let mut pending = BinaryHeap::new();
    let mut next_seq = 0_u64;

    loop {
        let now = Instant::now();
        while pending
            .peek()
            .is_some_and(|entry: &DelayedEntry| entry.run_time <= now)
        {
            let Some(entry) = pending.pop() else { break };
            trace!(posted_from = %entry.task.posted_from, "delayed task due");
            (entry.callback)(entry.task);
        }

        let DelayedTask { task, callback } = match pending.peek() {
            Some(entry) => match receiver.recv_deadline(entry.run_time) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        pending.push(DelayedEntry {
            run_time: task.delayed_run_time(),
            seq: next_seq,
            task,
            callback,
        });
        next_seq += 1;
    }

    info!(dropped = pending.len(), "DelayedTaskManager stopped");
}
