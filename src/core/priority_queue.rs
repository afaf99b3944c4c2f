//! Ready queue of a worker pool, ordered by [`SortKey`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::core::task_source::{same_source, SortKey, TaskSource};
use crate::core::task_tracker::RegisteredTaskSource;

/// Heap entry: the sort key is captured at push time so that ordering does
/// not lock the source.
struct QueueEntry {
    key: SortKey,
    seq: u64,
    source: RegisteredTaskSource,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Greater key first, then insertion order (reversed for max-heap).
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn source_addr(source: &Arc<dyn TaskSource>) -> usize {
    Arc::as_ptr(source).cast::<()>().addr()
}

/// Registered task sources waiting for a worker, highest sort key first.
/// Push, pop and membership checks are O(log n) or better; removing or
/// re-keying a queued source is O(n), and O(1) when it is not queued.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    /// Number of heap entries per source address.
    queued: HashMap<usize, usize>,
}

impl PriorityQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a source with its current sort key.
    pub fn push(&mut self, source: RegisteredTaskSource) {
        let key = source.sort_key();
        self.push_with_key(source, key);
    }

    /// Push a source with a key computed by the caller.
    pub fn push_with_key(&mut self, source: RegisteredTaskSource, key: SortKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        *self.queued.entry(source_addr(source.source())).or_default() += 1;
        self.heap.push(QueueEntry { key, seq, source });
    }

    /// Key of the source that would be popped next.
    #[must_use]
    pub fn peek_sort_key(&self) -> Option<SortKey> {
        self.heap.peek().map(|entry| entry.key)
    }

    /// Source that would be popped next.
    #[must_use]
    pub fn peek_source(&self) -> Option<&Arc<dyn TaskSource>> {
        self.heap.peek().map(|entry| entry.source.source())
    }

    /// Remove and return the highest-keyed source.
    pub fn pop(&mut self) -> Option<RegisteredTaskSource> {
        let entry = self.heap.pop()?;
        self.forget(entry.source.source());
        Some(entry.source)
    }

    fn forget(&mut self, source: &Arc<dyn TaskSource>) {
        let addr = source_addr(source);
        if let Some(count) = self.queued.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                self.queued.remove(&addr);
            }
        }
    }

    /// Remove `source` if queued.
    pub fn remove(&mut self, source: &Arc<dyn TaskSource>) -> Option<RegisteredTaskSource> {
        if !self.contains(source) {
            return None;
        }
        let mut removed = None;
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .filter_map(|entry| {
                if removed.is_none() && same_source(entry.source.source(), source) {
                    removed = Some(entry.source);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        if removed.is_some() {
            self.forget(source);
        }
        removed
    }

    /// Re-key `source` if queued. Returns whether it was found.
    pub fn update_sort_key(&mut self, source: &Arc<dyn TaskSource>, key: SortKey) -> bool {
        if !self.contains(source) {
            return false;
        }
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let found = entries
            .iter_mut()
            .find(|entry| same_source(entry.source.source(), source))
            .map(|entry| entry.key = key)
            .is_some();
        self.heap = BinaryHeap::from(entries);
        found
    }

    /// Whether `source` is queued.
    #[must_use]
    pub fn contains(&self, source: &Arc<dyn TaskSource>) -> bool {
        self.queued.contains_key(&source_addr(source))
    }

    /// Number of queued sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no source is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every queued source, in no particular order.
    pub fn drain(&mut self) -> Vec<RegisteredTaskSource> {
        self.queued.clear();
        self.heap.drain().map(|entry| entry.source).collect()
    }
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .field("top", &self.peek_sort_key())
            .finish()
    }
}
