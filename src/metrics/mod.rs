//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks group limits, scaling decisions and vetoes, probe failures,
//! guard outcomes, checkpoint writes/races and dependency transitions.
//!
//! # Example
//!
//! ```ignore
//! use jobwarden::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_scaling("batch", "up", 4);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    CHECKPOINT_RACES_TOTAL, CHECKPOINT_WRITES_TOTAL, GRAPH_TRANSITIONS_TOTAL, GROUP_PARALLELISM,
    GUARD_CHECKS_TOTAL, PROBE_FAILURES_TOTAL, REGISTRY, SCALE_UP_VETOES_TOTAL,
    SCALING_DECISIONS_TOTAL,
};
