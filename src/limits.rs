//! Per-job hard memory limits.
//!
//! Every submitted job carries a `MemoryCap`: a hard ceiling with swap
//! disabled, so a job that outgrows its estimate is killed by the kernel
//! instead of pushing the host into swap.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::autoscale::GroupResourceProfile;
use crate::job::JobIdentity;

const MIB: u64 = 1024 * 1024;

/// Smallest hard limit ever handed out, in MiB.
pub const MIN_MEMORY_CAP_MB: u64 = 64;

/// Default multiplier applied to a group's per-job memory estimate.
pub const DEFAULT_HEADROOM_FACTOR: f64 = 1.0;

/// Hard memory limit of one job. Swap is always disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MemoryCapRepr", into = "MemoryCapRepr")]
pub struct MemoryCap {
    hard_limit_bytes: u64,
}

#[derive(Serialize, Deserialize)]
struct MemoryCapRepr {
    hard_limit_bytes: u64,
    swap_disabled: bool,
}

impl TryFrom<MemoryCapRepr> for MemoryCap {
    type Error = String;

    fn try_from(repr: MemoryCapRepr) -> Result<Self, Self::Error> {
        if !repr.swap_disabled {
            return Err("memory caps with swap enabled are not supported".to_string());
        }
        Ok(Self::from_bytes(repr.hard_limit_bytes))
    }
}

impl From<MemoryCap> for MemoryCapRepr {
    fn from(cap: MemoryCap) -> Self {
        Self {
            hard_limit_bytes: cap.hard_limit_bytes,
            swap_disabled: true,
        }
    }
}

impl MemoryCap {
    /// Cap of `bytes`, rounded up to whole MiB with a 64 MiB floor.
    pub fn from_bytes(bytes: u64) -> Self {
        let mib = bytes.div_ceil(MIB).max(MIN_MEMORY_CAP_MB);
        Self {
            hard_limit_bytes: mib.saturating_mul(MIB),
        }
    }

    pub fn from_mib(mib: u64) -> Self {
        Self::from_bytes(mib.saturating_mul(MIB))
    }

    pub fn hard_limit_bytes(&self) -> u64 {
        self.hard_limit_bytes
    }

    pub fn hard_limit_mib(&self) -> u64 {
        self.hard_limit_bytes / MIB
    }

    /// Always `true`.
    pub fn swap_disabled(&self) -> bool {
        true
    }

    /// Limit in the `<n>m` notation docker and most runtimes accept.
    pub fn memory_string(&self) -> String {
        format!("{}m", self.hard_limit_mib())
    }

    /// `docker run` flags enforcing the cap.
    ///
    /// `--memory-swap` equal to `--memory` leaves no swap allowance.
    pub fn docker_args(&self) -> Vec<String> {
        let memory = self.memory_string();
        vec![
            format!("--memory={}", memory),
            format!("--memory-swap={}", memory),
            "--memory-swappiness=0".to_string(),
        ]
    }

    /// systemd unit properties enforcing the cap.
    pub fn systemd_properties(&self) -> Vec<String> {
        vec![
            format!("MemoryMax={}M", self.hard_limit_mib()),
            "MemorySwapMax=0".to_string(),
        ]
    }
}

/// Derives the hard memory limit of each job at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCapPolicy {
    /// Multiplier applied to the group's per-job memory estimate.
    #[serde(default = "default_headroom_factor")]
    pub headroom_factor: f64,
    /// Fixed limits in MiB for specific job families.
    #[serde(default)]
    pub family_overrides: HashMap<String, u64>,
}

fn default_headroom_factor() -> f64 {
    DEFAULT_HEADROOM_FACTOR
}

impl Default for MemoryCapPolicy {
    fn default() -> Self {
        Self {
            headroom_factor: DEFAULT_HEADROOM_FACTOR,
            family_overrides: HashMap::new(),
        }
    }
}

impl MemoryCapPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the headroom factor.
    pub fn with_headroom_factor(mut self, factor: f64) -> Self {
        self.headroom_factor = factor;
        self
    }

    /// Builder method to pin the limit of a family.
    pub fn with_family_override(mut self, family: impl Into<String>, memory_mb: u64) -> Self {
        self.family_overrides.insert(family.into(), memory_mb);
        self
    }

    /// Computes the cap for one job of `profile`'s group.
    pub fn derive_limit(&self, identity: &JobIdentity, profile: &GroupResourceProfile) -> MemoryCap {
        if let Some(&mb) = self.family_overrides.get(&identity.family) {
            return MemoryCap::from_mib(mb);
        }

        let estimate = profile.per_job_memory_bytes() as f64 * self.headroom_factor.max(0.0);
        MemoryCap::from_bytes(estimate.ceil() as u64)
    }
}
