//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites record
//! with consistent labels and never fail when metrics are not initialized.

use super::prometheus::{
    BRIDGE_MESSAGES_TOTAL, CANISTER_REQUESTS_TOTAL, QUEUE_DEPTH, STORE_ERRORS_TOTAL,
    TRIGGERS_TOTAL, WORKER_ACTIVE, WORKER_RUNS_TOTAL, WORKER_RUN_DURATION,
};

/// Metrics collector for recording avai-dispatch operational metrics.
///
/// Zero-sized; every method is a no-op until `init_metrics()` has run.
///
/// ```ignore
/// use avai_dispatch::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_worker_run("success", 42.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Update the prompt queue gauges.
    pub fn update_queue_depth(&self, pending: u64, processing: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["pending"])
                .set(pending as f64);
            queue_depth
                .with_label_values(&["processing"])
                .set(processing as f64);
        }

        tracing::trace!(
            pending = pending,
            processing = processing,
            "Updated queue depth metric"
        );
    }

    /// Record a finished worker run.
    ///
    /// # Arguments
    ///
    /// * `outcome` - One of "success", "failure", "timeout", "stopped"
    /// * `duration_secs` - Wall-clock run time in seconds
    pub fn record_worker_run(&self, outcome: &str, duration_secs: f64) {
        if let Some(runs) = WORKER_RUNS_TOTAL.get() {
            runs.with_label_values(&[outcome]).inc();
        }

        if let Some(duration) = WORKER_RUN_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded worker run metric"
        );
    }

    /// Set whether a worker is live.
    pub fn set_worker_active(&self, active: bool) {
        if let Some(gauge) = WORKER_ACTIVE.get() {
            gauge.set(if active { 1.0 } else { 0.0 });
        }
    }

    /// Record a consumed automation trigger.
    pub fn record_trigger(&self, action: &str) {
        if let Some(triggers) = TRIGGERS_TOTAL.get() {
            triggers.with_label_values(&[action]).inc();
        }
    }

    /// Record a result handled by the bridge.
    ///
    /// # Arguments
    ///
    /// * `status` - One of "forwarded", "failed", "malformed"
    pub fn record_bridge_message(&self, status: &str) {
        if let Some(messages) = BRIDGE_MESSAGES_TOTAL.get() {
            messages.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded bridge message metric");
    }

    /// Record a processed canister request.
    pub fn record_canister_request(&self, kind: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        if let Some(requests) = CANISTER_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[kind, status]).inc();
        }
    }

    /// Record a store error seen by a component.
    pub fn record_store_error(&self, component: &str) {
        if let Some(errors) = STORE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[component]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_worker_runs() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.set_worker_active(true);
        collector.record_worker_run("success", 12.5);
        collector.record_worker_run("timeout", 300.0);
        collector.set_worker_active(false);

        assert!(export_metrics().contains("avai_worker_run_duration_seconds"));
    }

    #[test]
    fn test_record_bridge_and_canister() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_bridge_message("forwarded");
        collector.record_bridge_message("malformed");
        collector.record_canister_request("deploy", true);
        collector.record_canister_request("query", false);
        collector.record_store_error("bridge");

        let text = export_metrics();
        assert!(text.contains("avai_bridge_messages_total"));
        assert!(text.contains("avai_canister_requests_total"));
    }

    #[test]
    fn test_update_queue_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(3, 1);
        collector.update_queue_depth(0, 0);
        collector.record_trigger("START_WORKER");
    }
}
