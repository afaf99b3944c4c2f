//! Benchmarks for the task scheduler.
//!
//! Benchmarks cover:
//! - Ready queue operations (push/pop/priority sorting)
//! - Sequence transactions
//! - End-to-end posting throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prometheus_task_scheduler::core::{PriorityQueue, TaskTracker};
use prometheus_task_scheduler::{
    JobDelegate, SchedulerConfig, Sequence, Task, TaskPriority, TaskRunner, TaskScheduler,
    TaskSource, TaskTraits, WorkerPoolParams,
};

// ============================================================================
// Helpers
// ============================================================================

const PRIORITIES: [TaskPriority; 3] = [
    TaskPriority::BestEffort,
    TaskPriority::UserVisible,
    TaskPriority::UserBlocking,
];

fn queued_sequence(priority: TaskPriority) -> Arc<dyn TaskSource> {
    let sequence = Sequence::new(TaskTraits::from(priority));
    sequence.begin_transaction().push_task(Task::new(|| {}));
    sequence
}

fn bench_scheduler() -> TaskScheduler {
    let scheduler = TaskScheduler::new(SchedulerConfig {
        label: "bench".into(),
        foreground: WorkerPoolParams::new(4),
        background: Some(WorkerPoolParams::new(2)),
    })
    .expect("valid config");
    scheduler.start().expect("scheduler starts");
    scheduler
}

// ============================================================================
// Ready queue
// ============================================================================

fn bench_priority_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue_push_pop");
    let tracker = Arc::new(TaskTracker::new());

    for size in [100_u64, 1_000, 10_000] {
        let mut rng = rand::rng();
        let sources: Vec<_> = (0..size)
            .map(|_| queued_sequence(PRIORITIES[rng.random_range(0..PRIORITIES.len())]))
            .collect();

        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &sources, |b, sources| {
            b.iter(|| {
                let mut queue = PriorityQueue::new();
                for source in sources {
                    let registered = tracker
                        .register_task_source(Arc::clone(source))
                        .expect("not shut down");
                    queue.push(registered);
                }
                while let Some(source) = queue.pop() {
                    black_box(source);
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Sequence
// ============================================================================

fn bench_sequence_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_transactions");

    for size in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let sequence = Sequence::new(TaskTraits::new());
                for _ in 0..size {
                    sequence.begin_transaction().push_task(Task::new(|| {}));
                }
                loop {
                    let mut txn = sequence.begin_transaction();
                    black_box(txn.sort_key());
                    let task = txn.take_task();
                    drop(task);
                    if txn.pop() {
                        break;
                    }
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// End to end
// ============================================================================

fn bench_post_and_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_and_flush");
    let scheduler = bench_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    for size in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(size));

        group.bench_with_input(BenchmarkId::new("parallel", size), &size, |b, &size| {
            let runner = scheduler.create_task_runner_with_traits(TaskTraits::new());
            b.iter(|| {
                for _ in 0..size {
                    let counter = Arc::clone(&counter);
                    runner.post_task(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                scheduler.flush_for_testing();
            });
        });

        group.bench_with_input(BenchmarkId::new("sequenced", size), &size, |b, &size| {
            let runner = scheduler.create_sequenced_task_runner_with_traits(TaskTraits::new());
            b.iter(|| {
                for _ in 0..size {
                    let counter = Arc::clone(&counter);
                    runner.post_task(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                scheduler.flush_for_testing();
            });
        });

        group.bench_with_input(BenchmarkId::new("job", size), &size, |b, &size| {
            b.iter(|| {
                let total = usize::try_from(size).unwrap_or(usize::MAX);
                let remaining = Arc::new(AtomicUsize::new(total));
                let work = Arc::clone(&remaining);
                let left = Arc::clone(&remaining);
                scheduler
                    .post_job(
                        TaskTraits::new(),
                        move |delegate: &JobDelegate<'_>| {
                            while !delegate.should_yield()
                                && work
                                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                        n.checked_sub(1)
                                    })
                                    .is_ok()
                            {}
                        },
                        move |_| left.load(Ordering::SeqCst).min(4),
                    )
                    .join();
            });
        });
    }
    group.finish();
    scheduler.join_for_testing();
}

criterion_group!(
    benches,
    bench_priority_queue_push_pop,
    bench_sequence_transactions,
    bench_post_and_flush
);
criterion_main!(benches);
