//! Duplicate-submission guard.
//!
//! Before a job is submitted the guard asks the queue daemon which
//! identities are queued or running. A candidate whose full identity
//! (family and every parameter) matches a live job is refused.
//!
//! The daemon may not list a job until some time after it was submitted, so
//! every `Clear` also records a local reservation for the identity. A second
//! check within the reservation TTL is refused even if the daemon does not
//! know the job yet. Reservations are process-local; two coordinators on the
//! same queue can still race, which the checkpoint key contract absorbs.
//!
//! The guard fails open: if the daemon cannot be asked in time, the job is
//! allowed through with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::job::JobIdentity;
use crate::metrics::MetricsCollector;
use crate::queue::JobQueueClient;

/// Default bound on the live-job query.
pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lifetime of a local reservation.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(30);

/// Result of a guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// No identical job is live; a reservation was taken.
    Clear,
    /// An identical job is queued, running, or reserved.
    AlreadyRunning,
}

impl GuardDecision {
    pub fn is_clear(&self) -> bool {
        matches!(self, GuardDecision::Clear)
    }
}

/// Refuses submissions of identities that are already live.
pub struct ConcurrencyGuard {
    queue: Arc<dyn JobQueueClient>,
    timeout: Duration,
    reservation_ttl: Duration,
    reservations: Mutex<HashMap<JobIdentity, Instant>>,
    metrics: MetricsCollector,
}

impl ConcurrencyGuard {
    pub fn new(queue: Arc<dyn JobQueueClient>) -> Self {
        Self {
            queue,
            timeout: DEFAULT_GUARD_TIMEOUT,
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            reservations: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Checks `identity` against live jobs and reserves it when clear.
    pub async fn check_and_reserve(&self, identity: &JobIdentity) -> GuardDecision {
        self.check_and_reserve_at(identity, Instant::now()).await
    }

    /// Same as [`check_and_reserve`](Self::check_and_reserve) with an
    /// explicit clock reading.
    pub async fn check_and_reserve_at(&self, identity: &JobIdentity, now: Instant) -> GuardDecision {
        // Reserve before asking the daemon so concurrent checks in this
        // process cannot both pass
        if !self.try_reserve(identity, now) {
            debug!(label = %identity, "Identity reserved by a recent submission");
            self.metrics.record_guard("already_running");
            return GuardDecision::AlreadyRunning;
        }

        match tokio::time::timeout(self.timeout, self.queue.list_running()).await {
            Ok(Ok(running)) => {
                if running.iter().any(|live| live == identity) {
                    self.release(identity);
                    info!(label = %identity, "Identical job already queued or running");
                    self.metrics.record_guard("already_running");
                    return GuardDecision::AlreadyRunning;
                }
                self.metrics.record_guard("clear");
            }
            Ok(Err(e)) => {
                warn!(label = %identity, error = %e, "Guard unavailable, allowing submission");
                self.metrics.record_guard("fail_open");
            }
            Err(_) => {
                warn!(
                    label = %identity,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Guard query timed out, allowing submission"
                );
                self.metrics.record_guard("fail_open");
            }
        }

        GuardDecision::Clear
    }

    fn try_reserve(&self, identity: &JobIdentity, now: Instant) -> bool {
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        reservations.retain(|_, expires| *expires > now);

        if reservations.contains_key(identity) {
            return false;
        }
        reservations.insert(identity.clone(), now + self.reservation_ttl);
        true
    }

    /// Drops the reservation of `identity`. Returns whether one existed.
    pub fn release(&self, identity: &JobIdentity) -> bool {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some()
    }

    /// Number of reservations, expired ones included.
    pub fn reservation_count(&self) -> usize {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
