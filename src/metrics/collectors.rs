//! High-level metric recording for coordinator operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites record
//! events without caring whether metrics were initialized.

use super::prometheus::{
    CHECKPOINT_RACES_TOTAL, CHECKPOINT_WRITES_TOTAL, GRAPH_TRANSITIONS_TOTAL, GROUP_PARALLELISM,
    GUARD_CHECKS_TOTAL, PROBE_FAILURES_TOTAL, SCALE_UP_VETOES_TOTAL, SCALING_DECISIONS_TOTAL,
};

/// Metrics collector for recording jobwarden operational metrics.
///
/// Recording is a no-op until `init_metrics()` has been called.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the current parallelism limit of a group.
    pub fn record_group_limit(&self, group: &str, limit: usize) {
        if let Some(gauge) = GROUP_PARALLELISM.get() {
            gauge.with_label_values(&[group]).set(limit as f64);
        }
    }

    /// Record an applied scaling decision.
    ///
    /// # Arguments
    ///
    /// * `group` - Group whose limit changed
    /// * `direction` - "up" or "down"
    /// * `new_limit` - Limit after the change
    pub fn record_scaling(&self, group: &str, direction: &str, new_limit: usize) {
        if let Some(counter) = SCALING_DECISIONS_TOTAL.get() {
            counter.with_label_values(&[group, direction]).inc();
        }
        self.record_group_limit(group, new_limit);

        tracing::trace!(
            group = group,
            direction = direction,
            new_limit = new_limit,
            "Recorded scaling metric"
        );
    }

    /// Record a scale-up declined by the memory safety check.
    pub fn record_veto(&self, group: &str) {
        if let Some(counter) = SCALE_UP_VETOES_TOTAL.get() {
            counter.with_label_values(&[group]).inc();
        }
    }

    /// Record a failed or timed-out resource probe.
    pub fn record_probe_failure(&self) {
        if let Some(counter) = PROBE_FAILURES_TOTAL.get() {
            counter.inc();
        }
    }

    /// Record a guard check outcome ("clear", "already_running", "fail_open").
    pub fn record_guard(&self, outcome: &str) {
        if let Some(counter) = GUARD_CHECKS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a checkpoint write and whether it raced another writer.
    pub fn record_checkpoint_write(&self, race_detected: bool) {
        if let Some(counter) = CHECKPOINT_WRITES_TOTAL.get() {
            counter.inc();
        }
        if race_detected {
            if let Some(counter) = CHECKPOINT_RACES_TOTAL.get() {
                counter.inc();
            }
        }
    }

    /// Record a dependency graph transition.
    pub fn record_graph_transition(&self, status: &str) {
        if let Some(counter) = GRAPH_TRANSITIONS_TOTAL.get() {
            counter.with_label_values(&[status]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_scaling("collector-test", "up", 4);
        collector.record_veto("collector-test");
        collector.record_probe_failure();
        collector.record_guard("clear");
        collector.record_checkpoint_write(true);
        collector.record_graph_transition("blocked");

        let exported = export_metrics();
        assert!(exported.contains("jobwarden_scaling_decisions_total"));
        assert!(exported.contains("collector-test"));
        assert!(exported.contains("jobwarden_checkpoint_races_total"));
    }

    #[test]
    fn test_recording_never_panics() {
        let collector = MetricsCollector::default();
        collector.record_group_limit("any", 1);
        collector.record_checkpoint_write(false);
    }
}
