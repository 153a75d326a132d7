//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobwarden and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Counter, CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobwarden metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Current parallelism limit, labeled by group.
pub static GROUP_PARALLELISM: OnceLock<GaugeVec> = OnceLock::new();

/// Applied scaling decisions, labeled by group and direction (up/down).
pub static SCALING_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scale-ups declined by the memory safety check, labeled by group.
pub static SCALE_UP_VETOES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Probe timeouts and failures.
pub static PROBE_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Guard checks, labeled by outcome (clear/already_running/fail_open).
pub static GUARD_CHECKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Checkpoint writes.
pub static CHECKPOINT_WRITES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Same-key checkpoint writes observed in flight at the same time.
pub static CHECKPOINT_RACES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Dependency graph transitions, labeled by target status.
pub static GRAPH_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let group_parallelism = GaugeVec::new(
        Opts::new(
            "jobwarden_group_parallelism",
            "Current parallelism limit per group",
        ),
        &["group"],
    )?;

    let scaling_decisions_total = CounterVec::new(
        Opts::new(
            "jobwarden_scaling_decisions_total",
            "Applied scaling decisions",
        ),
        &["group", "direction"],
    )?;

    let scale_up_vetoes_total = CounterVec::new(
        Opts::new(
            "jobwarden_scale_up_vetoes_total",
            "Scale-ups declined by the memory safety check",
        ),
        &["group"],
    )?;

    let probe_failures_total = Counter::new(
        "jobwarden_probe_failures_total",
        "Resource probe timeouts and failures",
    )?;

    let guard_checks_total = CounterVec::new(
        Opts::new("jobwarden_guard_checks_total", "Concurrency guard checks"),
        &["outcome"],
    )?;

    let checkpoint_writes_total =
        Counter::new("jobwarden_checkpoint_writes_total", "Checkpoint writes")?;

    let checkpoint_races_total = Counter::new(
        "jobwarden_checkpoint_races_total",
        "Concurrent same-key checkpoint writes",
    )?;

    let graph_transitions_total = CounterVec::new(
        Opts::new(
            "jobwarden_graph_transitions_total",
            "Dependency graph transitions",
        ),
        &["status"],
    )?;

    registry.register(Box::new(group_parallelism.clone()))?;
    registry.register(Box::new(scaling_decisions_total.clone()))?;
    registry.register(Box::new(scale_up_vetoes_total.clone()))?;
    registry.register(Box::new(probe_failures_total.clone()))?;
    registry.register(Box::new(guard_checks_total.clone()))?;
    registry.register(Box::new(checkpoint_writes_total.clone()))?;
    registry.register(Box::new(checkpoint_races_total.clone()))?;
    registry.register(Box::new(graph_transitions_total.clone()))?;

    // A second call leaves the first set of metrics in place
    let _ = REGISTRY.set(registry);
    let _ = GROUP_PARALLELISM.set(group_parallelism);
    let _ = SCALING_DECISIONS_TOTAL.set(scaling_decisions_total);
    let _ = SCALE_UP_VETOES_TOTAL.set(scale_up_vetoes_total);
    let _ = PROBE_FAILURES_TOTAL.set(probe_failures_total);
    let _ = GUARD_CHECKS_TOTAL.set(guard_checks_total);
    let _ = CHECKPOINT_WRITES_TOTAL.set(checkpoint_writes_total);
    let _ = CHECKPOINT_RACES_TOTAL.set(checkpoint_races_total);
    let _ = GRAPH_TRANSITIONS_TOTAL.set(graph_transitions_total);

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
