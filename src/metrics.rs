use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const COUNTERS: [&str; 13] = [
    "feed_events_total",
    "feed_reconnects_total",
    "feed_gaps_total",
    "feed_malformed_total",
    "feed_duplicates_total",
    "intents_emitted_total",
    "triggers_skipped_total",
    "intents_deduplicated_total",
    "executions_succeeded_total",
    "executions_failed_total",
    "executions_abandoned_total",
    "execution_retries_total",
    "reconciled_attempts_total",
];

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    register_metrics();
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally. Used by
/// tests, which may build many routers in one process.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn register_metrics() {
    // Pre-register counters so they appear even before the first increment.
    for name in COUNTERS {
        counter!(name).absolute(0);
    }

    gauge!("guard_entries").set(0.0);
    gauge!("registry_entities").set(0.0);

    // Histograms are lazily created on first record; force creation.
    histogram!("evaluation_latency_seconds").record(0.0);
    histogram!("execution_latency_seconds").record(0.0);
}
