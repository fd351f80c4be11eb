//! Metrics module for Prometheus-based monitoring.
//!
//! Covers queue depth, worker runs, triggers, bridge forwarding and canister
//! requests. An optional HTTP endpoint serves the text exposition.
//!
//! # Example
//!
//! ```ignore
//! use avai_dispatch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_bridge_message("forwarded");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics, metrics_handler};
