//! Ordered queue of tasks that run one at a time, in posting order.
//!
//! All reads and writes of a [`Sequence`] go through a [`Transaction`], which
//! holds the sequence lock for its whole lifetime. Beginning a second
//! transaction on a thread that already holds one panics instead of
//! deadlocking.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::core::task::Task;
use crate::core::task_runner::SequencedTaskRunner;
use crate::core::task_source::{ExecutionMode, RunStatus, SortKey, TaskSource};
use crate::core::traits::{TaskPriority, TaskTraits};

static NEXT_SEQUENCE_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_MARKER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_SEQUENCE: Cell<Option<SequenceToken>> = const { Cell::new(None) };
    static THREAD_MARKER: u64 = NEXT_THREAD_MARKER.fetch_add(1, Ordering::Relaxed);
}

/// Unique identity of a sequence. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken(NonZeroU64);

impl SequenceToken {
    /// Allocate a fresh token.
    #[must_use]
    pub fn create() -> Self {
        let raw = NEXT_SEQUENCE_TOKEN.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Token of the sequence whose task is running on this thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_SEQUENCE.with(Cell::get)
    }

    /// Raw numeric value, for logging.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Marks a sequence as current on this thread until dropped.
pub(crate) struct ScopedSequenceToken {
    previous: Option<SequenceToken>,
}

impl ScopedSequenceToken {
    pub(crate) fn enter(token: Option<SequenceToken>) -> Self {
        let previous = CURRENT_SEQUENCE.with(|current| current.replace(token));
        Self { previous }
    }
}

impl Drop for ScopedSequenceToken {
    fn drop(&mut self) {
        CURRENT_SEQUENCE.with(|current| current.set(self.previous));
    }
}

fn thread_marker() -> u64 {
    THREAD_MARKER.with(|marker| *marker)
}

struct Slot {
    queue_time: Instant,
    // `None` once taken by a worker, until `pop()`.
    task: Option<Task>,
}

struct SequenceState {
    traits: TaskTraits,
    queue: VecDeque<Slot>,
    has_worker: bool,
}

/// An ordered, single-consumer queue of tasks.
pub struct Sequence {
    token: SequenceToken,
    execution_mode: ExecutionMode,
    state: Mutex<SequenceState>,
    // Marker of the thread holding a transaction, 0 when none.
    transaction_holder: AtomicU64,
    task_runner: Option<Weak<SequencedTaskRunner>>,
}

impl Sequence {
    /// Create a sequence for tasks that must run in posting order.
    #[must_use]
    pub fn new(traits: TaskTraits) -> Arc<Self> {
        Arc::new(Self::build(traits, ExecutionMode::Sequenced, None))
    }

    /// Create a one-off sequence for a parallel task.
    #[must_use]
    pub fn new_parallel(traits: TaskTraits) -> Arc<Self> {
        Arc::new(Self::build(traits, ExecutionMode::Parallel, None))
    }

    pub(crate) fn with_task_runner(
        traits: TaskTraits,
        task_runner: Weak<SequencedTaskRunner>,
    ) -> Self {
        Self::build(traits, ExecutionMode::Sequenced, Some(task_runner))
    }

    fn build(
        traits: TaskTraits,
        execution_mode: ExecutionMode,
        task_runner: Option<Weak<SequencedTaskRunner>>,
    ) -> Self {
        Self {
            token: SequenceToken::create(),
            execution_mode,
            state: Mutex::new(SequenceState {
                traits,
                queue: VecDeque::new(),
                has_worker: false,
            }),
            transaction_holder: AtomicU64::new(0),
            task_runner,
        }
    }

    /// Identity of this sequence.
    #[must_use]
    pub const fn token(&self) -> SequenceToken {
        self.token
    }

    /// The task runner that created this sequence, if it is still alive.
    #[must_use]
    pub fn task_runner(&self) -> Option<Arc<SequencedTaskRunner>> {
        self.task_runner.as_ref().and_then(Weak::upgrade)
    }

    /// Lock the sequence for a series of reads and writes.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds a transaction on this
    /// sequence.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        let me = thread_marker();
        assert_ne!(
            self.transaction_holder.load(Ordering::Relaxed),
            me,
            "begin_transaction() called twice on sequence {} from the same thread",
            self.token.get()
        );
        let state = self.state.lock();
        self.transaction_holder.store(me, Ordering::Relaxed);
        Transaction {
            sequence: self,
            state,
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("token", &self.token)
            .field("execution_mode", &self.execution_mode)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a [`Sequence`], released on drop.
pub struct Transaction<'a> {
    sequence: &'a Sequence,
    state: MutexGuard<'a, SequenceState>,
}

impl Transaction<'_> {
    /// The sequence this transaction locks.
    #[must_use]
    pub const fn sequence(&self) -> &Sequence {
        self.sequence
    }

    /// Append a task. Returns `true` iff the sequence was empty, in which
    /// case the caller must enqueue it in a pool.
    pub fn push_task(&mut self, mut task: Task) -> bool {
        let was_empty = self.state.queue.is_empty();
        let now = Instant::now();
        task.mark_ready(now);
        self.state.queue.push_back(Slot {
            queue_time: now,
            task: Some(task),
        });
        was_empty
    }

    /// Take the front task, leaving a placeholder until [`Self::pop`].
    ///
    /// # Panics
    ///
    /// Panics if the sequence is empty or the front task was already taken.
    pub fn take_task(&mut self) -> Task {
        let Some(front) = self.state.queue.front_mut() else {
            panic!("take_task() on an empty sequence");
        };
        let Some(task) = front.task.take() else {
            panic!("take_task() called twice without pop()");
        };
        task
    }

    /// Remove the placeholder left by [`Self::take_task`]. Returns `true` iff
    /// the sequence is empty afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the sequence is empty or the front task was not taken.
    pub fn pop(&mut self) -> bool {
        let Some(front) = self.state.queue.front() else {
            panic!("pop() on an empty sequence");
        };
        assert!(front.task.is_none(), "pop() called before take_task()");
        self.state.queue.pop_front();
        self.state.queue.is_empty()
    }

    /// Priority and ready time of the front task.
    ///
    /// # Panics
    ///
    /// Panics if the sequence is empty.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        let Some(front) = self.state.queue.front() else {
            panic!("sort_key() on an empty sequence");
        };
        SortKey::new(self.state.traits.priority, front.queue_time)
    }

    /// Change the priority. Moving the sequence to another pool is up to the
    /// scheduler.
    pub fn update_priority(&mut self, priority: TaskPriority) {
        self.state.traits.priority = priority;
    }

    /// Current traits.
    #[must_use]
    pub fn traits(&self) -> TaskTraits {
        self.state.traits
    }

    /// Whether no task (taken or not) is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.queue.is_empty()
    }

    /// Number of queued slots, including a taken placeholder.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.queue.len()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.sequence.transaction_holder.store(0, Ordering::Relaxed);
    }
}

impl TaskSource for Sequence {
    fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    fn traits(&self) -> TaskTraits {
        self.begin_transaction().traits()
    }

    fn will_run_task(&self) -> RunStatus {
        let mut txn = self.begin_transaction();
        if txn.state.has_worker || txn.state.queue.is_empty() {
            return RunStatus::Disallowed;
        }
        txn.state.has_worker = true;
        RunStatus::AllowedSaturated
    }

    fn take_task(&self) -> Task {
        let mut txn = self.begin_transaction();
        assert!(txn.state.has_worker, "take_task() without a granted claim");
        txn.take_task()
    }

    fn did_process_task(&self) -> bool {
        let mut txn = self.begin_transaction();
        assert!(txn.state.has_worker, "did_process_task() without a granted claim");
        txn.state.has_worker = false;
        !txn.pop()
    }

    fn clear(&self) {
        let dropped = {
            let mut txn = self.begin_transaction();
            txn.state.has_worker = false;
            std::mem::take(&mut txn.state.queue)
        };
        // Task destructors may post; run them without the lock.
        drop(dropped);
    }

    fn sort_key(&self) -> SortKey {
        self.begin_transaction().sort_key()
    }

    fn remaining_concurrency(&self) -> usize {
        let txn = self.begin_transaction();
        usize::from(!txn.state.has_worker && !txn.state.queue.is_empty())
    }

    fn update_priority(&self, priority: TaskPriority) {
        self.begin_transaction().update_priority(priority);
    }

    fn sequence_token(&self) -> Option<SequenceToken> {
        Some(self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Mutex as StdMutex;

    fn recording_task(log: &Arc<StdMutex<Vec<usize>>>, id: usize) -> Task {
        let log = Arc::clone(log);
        Task::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn test_push_returns_true_only_when_empty() {
        let sequence = Sequence::new(TaskTraits::new());
        let mut txn = sequence.begin_transaction();
        assert!(txn.push_task(Task::new(|| {})));
        assert!(!txn.push_task(Task::new(|| {})));
        assert!(!txn.push_task(Task::new(|| {})));

        let _ = txn.take_task();
        assert!(!txn.pop());
        let _ = txn.take_task();
        assert!(!txn.pop());
        let _ = txn.take_task();
        assert!(txn.pop());

        // Empty again: next push is a new empty -> non-empty transition.
        assert!(txn.push_task(Task::new(|| {})));
    }

    #[test]
    fn test_push_while_front_taken_is_not_empty() {
        let sequence = Sequence::new(TaskTraits::new());
        let mut txn = sequence.begin_transaction();
        assert!(txn.push_task(Task::new(|| {})));
        let _running = txn.take_task();
        assert!(!txn.push_task(Task::new(|| {})));
        assert!(!txn.pop());
    }

    #[test]
    fn test_fifo_with_priority_updates() {
        let sequence = Sequence::new(TaskTraits::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let priorities = [
            TaskPriority::BestEffort,
            TaskPriority::UserVisible,
            TaskPriority::UserBlocking,
        ];
        let mut rng = rand::rng();

        for id in 0..64 {
            let mut txn = sequence.begin_transaction();
            if rng.random_bool(0.3) {
                txn.update_priority(priorities[rng.random_range(0..priorities.len())]);
            }
            txn.push_task(recording_task(&log, id));
        }

        loop {
            let mut txn = sequence.begin_transaction();
            if txn.is_empty() {
                break;
            }
            if rng.random_bool(0.3) {
                txn.update_priority(priorities[rng.random_range(0..priorities.len())]);
            }
            let task = txn.take_task();
            txn.pop();
            drop(txn);
            task.run();
        }

        let ran = log.lock().unwrap().clone();
        assert_eq!(ran, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_key_reflects_priority_and_front_time() {
        let sequence = Sequence::new(TaskTraits::new());
        let mut txn = sequence.begin_transaction();
        txn.push_task(Task::new(|| {}));
        let first = txn.sort_key();
        txn.push_task(Task::new(|| {}));
        assert_eq!(txn.sort_key(), first);

        txn.update_priority(TaskPriority::UserBlocking);
        let updated = txn.sort_key();
        assert_eq!(updated.priority, TaskPriority::UserBlocking);
        assert_eq!(updated.ready_time, first.ready_time);
    }

    #[test]
    #[should_panic(expected = "empty sequence")]
    fn test_sort_key_on_empty_panics() {
        let sequence = Sequence::new(TaskTraits::new());
        let _ = sequence.begin_transaction().sort_key();
    }

    #[test]
    #[should_panic(expected = "take_task() called twice")]
    fn test_double_take_panics() {
        let sequence = Sequence::new(TaskTraits::new());
        let mut txn = sequence.begin_transaction();
        txn.push_task(Task::new(|| {}));
        let _ = txn.take_task();
        let _ = txn.take_task();
    }

    #[test]
    #[should_panic(expected = "pop() called before take_task()")]
    fn test_pop_before_take_panics() {
        let sequence = Sequence::new(TaskTraits::new());
        let mut txn = sequence.begin_transaction();
        txn.push_task(Task::new(|| {}));
        txn.pop();
    }

    #[test]
    #[should_panic(expected = "begin_transaction() called twice")]
    fn test_nested_transaction_panics() {
        let sequence = Sequence::new(TaskTraits::new());
        let _outer = sequence.begin_transaction();
        let _inner = sequence.begin_transaction();
    }

    #[test]
    fn test_transactions_from_other_threads_serialize() {
        let sequence = Sequence::new(TaskTraits::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequence = Arc::clone(&sequence);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        sequence.begin_transaction().push_task(Task::new(|| {}));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sequence.begin_transaction().len(), 400);
    }

    #[test]
    fn test_claim_protocol() {
        let sequence = Sequence::new(TaskTraits::new());
        assert_eq!(sequence.will_run_task(), RunStatus::Disallowed);

        sequence.begin_transaction().push_task(Task::new(|| {}));
        sequence.begin_transaction().push_task(Task::new(|| {}));
        assert_eq!(sequence.remaining_concurrency(), 1);

        assert_eq!(sequence.will_run_task(), RunStatus::AllowedSaturated);
        // A second worker may not run the same sequence concurrently.
        assert_eq!(sequence.will_run_task(), RunStatus::Disallowed);
        assert_eq!(sequence.remaining_concurrency(), 0);

        sequence.take_task().run();
        assert!(sequence.did_process_task());

        assert_eq!(sequence.will_run_task(), RunStatus::AllowedSaturated);
        sequence.take_task().run();
        assert!(!sequence.did_process_task());
    }

    #[test]
    #[should_panic(expected = "without a granted claim")]
    fn test_take_without_claim_panics() {
        let sequence = Sequence::new(TaskTraits::new());
        sequence.begin_transaction().push_task(Task::new(|| {}));
        let _ = TaskSource::take_task(sequence.as_ref());
    }

    #[test]
    fn test_clear_drops_pending_tasks() {
        let sequence = Sequence::new(TaskTraits::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        sequence.begin_transaction().push_task(recording_task(&log, 1));
        sequence.begin_transaction().push_task(recording_task(&log, 2));

        assert!(sequence.will_run_task().is_allowed());
        sequence.clear();

        assert!(sequence.begin_transaction().is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sequence.will_run_task(), RunStatus::Disallowed);
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = Sequence::new(TaskTraits::new());
        let b = Sequence::new_parallel(TaskTraits::new());
        assert_ne!(a.token(), b.token());
        assert_eq!(b.execution_mode(), ExecutionMode::Parallel);
    }

    #[test]
    fn test_scoped_sequence_token() {
        let token = SequenceToken::create();
        assert_eq!(SequenceToken::current(), None);
        {
            let _scope = ScopedSequenceToken::enter(Some(token));
            assert_eq!(SequenceToken::current(), Some(token));
        }
        assert_eq!(SequenceToken::current(), None);
    }
}
