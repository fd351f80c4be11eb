//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by avai-dispatch and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all avai-dispatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Prompt queue depth, labeled by state (pending/processing).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Total worker runs, labeled by outcome.
pub static WORKER_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker run duration in seconds.
pub static WORKER_RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// 1 while a worker process is live, 0 otherwise.
pub static WORKER_ACTIVE: OnceLock<Gauge> = OnceLock::new();

/// Total consumed automation triggers, labeled by action.
pub static TRIGGERS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total bridge messages, labeled by status (forwarded/failed/malformed).
pub static BRIDGE_MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total canister requests, labeled by kind and status.
pub static CANISTER_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total store errors, labeled by component.
pub static STORE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry that is
/// discarded, so the first registration wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("avai_queue_depth", "Number of prompts in the queue"),
        &["state"],
    )?;

    // Worker metrics
    let worker_runs_total = CounterVec::new(
        Opts::new("avai_worker_runs_total", "Total worker runs by outcome"),
        &["outcome"],
    )?;

    let worker_run_duration = Histogram::with_opts(
        HistogramOpts::new(
            "avai_worker_run_duration_seconds",
            "Worker run duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let worker_active = Gauge::new("avai_worker_active", "Whether a worker process is live")?;

    let triggers_total = CounterVec::new(
        Opts::new("avai_triggers_total", "Total automation triggers consumed"),
        &["action"],
    )?;

    // Bridge metrics
    let bridge_messages_total = CounterVec::new(
        Opts::new("avai_bridge_messages_total", "Total results handled by the bridge"),
        &["status"],
    )?;

    let canister_requests_total = CounterVec::new(
        Opts::new("avai_canister_requests_total", "Total canister requests handled"),
        &["kind", "status"],
    )?;

    let store_errors_total = CounterVec::new(
        Opts::new("avai_store_errors_total", "Total Redis errors by component"),
        &["component"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(worker_runs_total.clone()))?;
    registry.register(Box::new(worker_run_duration.clone()))?;
    registry.register(Box::new(worker_active.clone()))?;
    registry.register(Box::new(triggers_total.clone()))?;
    registry.register(Box::new(bridge_messages_total.clone()))?;
    registry.register(Box::new(canister_requests_total.clone()))?;
    registry.register(Box::new(store_errors_total.clone()))?;

    // Already-set statics mean a previous call won; keep its metrics
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = WORKER_RUNS_TOTAL.set(worker_runs_total);
    let _ = WORKER_RUN_DURATION.set(worker_run_duration);
    let _ = WORKER_ACTIVE.set(worker_active);
    let _ = TRIGGERS_TOTAL.set(triggers_total);
    let _ = BRIDGE_MESSAGES_TOTAL.set(bridge_messages_total);
    let _ = CANISTER_REQUESTS_TOTAL.set(canister_requests_total);
    let _ = STORE_ERRORS_TOTAL.set(store_errors_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
