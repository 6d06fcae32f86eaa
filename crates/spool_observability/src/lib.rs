//! Observability setup: structured logging, metrics (Prometheus).

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default filter when neither `RUST_LOG` nor config supplies one.
pub const DEFAULT_LOG_FILTER: &str = "info,spool=debug";

/// Initialize the global tracing subscriber with structured logging.
///
/// `RUST_LOG` wins over `default_filter`. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Queue depth and capacity after an insert or drain.
pub fn record_queue_depth(len: usize, effective_capacity: usize) {
    metrics::gauge!("spool_queue_depth").set(len as f64);
    metrics::gauge!("spool_queue_effective_capacity").set(effective_capacity as f64);
}

/// A producer had to wait for capacity.
pub fn record_blocked_insert(wait_us: u64) {
    metrics::counter!("spool_queue_blocked_inserts_total").increment(1);
    metrics::histogram!("spool_queue_insert_wait_us").record(wait_us as f64);
}

/// Running average entry size changed.
pub fn record_avg_entry_bytes(avg: u64) {
    metrics::gauge!("spool_queue_avg_entry_bytes").set(avg as f64);
}

pub fn record_produced(worker: &str, count: u64) {
    metrics::counter!("spool_records_produced_total", "worker" => worker.to_string())
        .increment(count);
}

pub fn record_consumed(count: u64) {
    metrics::counter!("spool_records_consumed_total").increment(count);
}

/// Outcome of one `execute()` call: "completed", "failed" or "aborted".
pub fn record_execution(outcome: &str, duration_us: u64) {
    metrics::counter!("spool_executions_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("spool_execution_duration_us", "outcome" => outcome.to_string())
        .record(duration_us as f64);
}
