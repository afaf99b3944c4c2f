//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing. The library never installs a subscriber itself;
/// binaries and tests may call this to get an env-filtered fmt subscriber
/// (`RUST_LOG=prometheus_task_scheduler=debug`) unless one is already set.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
