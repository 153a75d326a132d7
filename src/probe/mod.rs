//! Host resource sampling for the autoscaler.
//!
//! `ResourceProbe` wraps an injected `HostProbe` with a timeout and a
//! last-known-good fallback. A probe that hangs or fails never blocks a
//! tick: the caller gets the previous sample marked `stale`, or an error
//! when nothing has been sampled yet.

pub mod host;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::metrics::MetricsCollector;

pub use host::{FixedHostProbe, HostProbe, HostSnapshot, LinuxHostProbe};

/// Default bound on a single sample.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resource state of the host as seen by the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Load average per CPU, in `[0.0, 1.0]`.
    pub cpu_load_fraction: f64,
    /// Available memory over total memory, in `[0.0, 1.0]`.
    pub memory_available_fraction: f64,
    pub memory_available_bytes: u64,
    pub memory_total_bytes: u64,
    /// Memory charged to each group, where the host tracks it.
    pub per_group_footprint: BTreeMap<String, u64>,
    pub sampled_at: DateTime<Utc>,
    /// The host could not be sampled; this is the last good sample.
    pub stale: bool,
}

/// Timeout-bounded sampler with last-known-good fallback.
pub struct ResourceProbe {
    host: Arc<dyn HostProbe>,
    timeout: Duration,
    last_good: Mutex<Option<ResourceSample>>,
    metrics: MetricsCollector,
}

impl ResourceProbe {
    pub fn new(host: Arc<dyn HostProbe>) -> Self {
        Self {
            host,
            timeout: DEFAULT_PROBE_TIMEOUT,
            last_good: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Most recent successful sample.
    pub fn last_known(&self) -> Option<ResourceSample> {
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Samples the host and the footprints of `groups`.
    ///
    /// # Errors
    ///
    /// Returns the probe failure (`ProbeError::Timeout` when the host did
    /// not answer in time) only when no earlier sample exists; otherwise
    /// the earlier sample is returned with `stale = true`.
    pub async fn sample(&self, groups: &[String]) -> Result<ResourceSample, ProbeError> {
        let result = match tokio::time::timeout(self.timeout, self.collect(groups)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };

        match result {
            Ok(sample) => {
                *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(sample.clone());
                Ok(sample)
            }
            Err(e) => self.fallback(e),
        }
    }

    fn fallback(&self, error: ProbeError) -> Result<ResourceSample, ProbeError> {
        self.metrics.record_probe_failure();

        match self.last_known() {
            Some(mut sample) => {
                warn!(
                    error = %error,
                    sampled_at = %sample.sampled_at,
                    "Host probe failed, using last known sample"
                );
                sample.stale = true;
                Ok(sample)
            }
            None => {
                warn!(error = %error, "Host probe failed with no prior sample");
                Err(error)
            }
        }
    }

    async fn collect(&self, groups: &[String]) -> Result<ResourceSample, ProbeError> {
        let snapshot = self.host.sample().await?;

        let mut per_group_footprint = BTreeMap::new();
        for group in groups {
            match self.host.group_footprint(group).await {
                Ok(Some(bytes)) => {
                    per_group_footprint.insert(group.clone(), bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(group = %group, error = %e, "Group footprint unavailable");
                }
            }
        }

        Ok(ResourceSample {
            cpu_load_fraction: snapshot.cpu_load_fraction(),
            memory_available_fraction: snapshot.memory_available_fraction(),
            memory_available_bytes: snapshot.memory_available_bytes,
            memory_total_bytes: snapshot.memory_total_bytes,
            per_group_footprint,
            sampled_at: Utc::now(),
            stale: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<String> {
        vec!["batch".to_string()]
    }

    #[tokio::test]
    async fn test_fresh_sample() {
        let host = Arc::new(FixedHostProbe::with_fractions(0.25, 0.5));
        host.set_footprint("batch", 2048);
        let probe = ResourceProbe::new(host);

        let sample = probe.sample(&groups()).await.expect("sample");
        assert!(!sample.stale);
        assert!((sample.cpu_load_fraction - 0.25).abs() < 1e-9);
        assert!((sample.memory_available_fraction - 0.5).abs() < 1e-6);
        assert_eq!(sample.per_group_footprint.get("batch"), Some(&2048));
        assert_eq!(probe.last_known(), Some(sample));
    }

    #[tokio::test]
    async fn test_failure_without_history_is_an_error() {
        let host = Arc::new(FixedHostProbe::with_fractions(0.25, 0.5));
        host.set_unavailable();
        let probe = ResourceProbe::new(host);

        assert!(matches!(
            probe.sample(&groups()).await,
            Err(ProbeError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_returns_stale_last_known_good() {
        let host = Arc::new(FixedHostProbe::with_fractions(0.25, 0.5));
        let probe = ResourceProbe::new(host.clone());

        let fresh = probe.sample(&groups()).await.expect("sample");
        host.set_unavailable();

        let stale = probe.sample(&groups()).await.expect("fallback");
        assert!(stale.stale);
        assert_eq!(stale.sampled_at, fresh.sampled_at);
        assert_eq!(stale.memory_available_bytes, fresh.memory_available_bytes);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out() {
        let host = Arc::new(FixedHostProbe::with_fractions(0.25, 0.5));
        host.set_delay(Some(Duration::from_secs(3600)));
        let probe = ResourceProbe::new(host).with_timeout(Duration::from_millis(50));

        assert!(matches!(
            probe.sample(&groups()).await,
            Err(ProbeError::Timeout(_))
        ));
    }
}
