//! Tests for the tokio bridge

#![cfg(feature = "tokio-runtime")]

use prometheus_task_scheduler::runtime::{join_async, post_task_and_reply_async, shutdown_async};
use prometheus_task_scheduler::{
    JobDelegate, SchedulerConfig, SchedulerError, TaskScheduler, TaskTraits, WorkerPoolParams,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn started() -> TaskScheduler {
    let scheduler = TaskScheduler::new(SchedulerConfig {
        label: "async".into(),
        foreground: WorkerPoolParams::new(2),
        background: None,
    })
    .unwrap();
    scheduler.start().unwrap();
    scheduler
}

#[tokio::test]
async fn test_post_task_and_reply_returns_value() {
    let scheduler = started();
    let runner = scheduler.create_sequenced_task_runner_with_traits(TaskTraits::new());

    let value = post_task_and_reply_async(runner.as_ref(), || 6 * 7).await.unwrap();
    assert_eq!(value, 42);
    scheduler.join_for_testing();
}

#[tokio::test]
async fn test_panicking_task_reports_dropped() {
    let scheduler = started();
    let runner = scheduler.create_task_runner_with_traits(TaskTraits::new());

    let result =
        post_task_and_reply_async(runner.as_ref(), || -> u32 { panic!("reply failure") }).await;
    assert!(matches!(result, Err(SchedulerError::TaskDropped)));
    scheduler.join_for_testing();
}

#[tokio::test]
async fn test_post_refused_after_shutdown() {
    let scheduler = started();
    let runner = scheduler.create_task_runner_with_traits(TaskTraits::new());
    shutdown_async(&scheduler).await.unwrap();

    let result = post_task_and_reply_async(runner.as_ref(), || ()).await;
    assert!(matches!(result, Err(SchedulerError::PostRefused)));
    scheduler.join_for_testing();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_async_waits_for_job() {
    let scheduler = started();
    let remaining = Arc::new(AtomicUsize::new(10));
    let work = Arc::clone(&remaining);
    let left = Arc::clone(&remaining);

    let handle = scheduler.post_job(
        TaskTraits::new(),
        move |_: &JobDelegate<'_>| {
            let _ = work.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        },
        move |_| left.load(Ordering::SeqCst).min(2),
    );
    join_async(handle).await.unwrap();
    assert_eq!(remaining.load(Ordering::SeqCst), 0);
    scheduler.join_for_testing();
}
