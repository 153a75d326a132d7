//! Resource-aware per-group parallelism control.
//!
//! Each group has a profile with hard bounds and a current limit owned by
//! the `Autoscaler`. Every tick the autoscaler samples the host once for all
//! groups that are not cooling down and moves each limit by one step:
//!
//! ```text
//!  Stable ──tick──► Probing ──┬─ cpu < 0.4 and mem > 0.4 ─► ScalingUp ──┐
//!    ▲                        ├─ cpu > 0.8 or  mem < 0.2 ─► ScalingDown ┤
//!    │                        └─ otherwise, veto, probe failure ─► Stable
//!    └──────── cooldown elapsed ◄──── Cooldown ◄───────────────────────┘
//! ```
//!
//! A scale-up is vetoed when `per_job_memory * candidate` would exceed the
//! available memory minus the safety margin. Probe failures leave limits
//! untouched.

pub mod controller;
pub mod profile;
pub mod state;

use std::time::Duration;

use crate::config::ConfigError;

pub use controller::{
    Autoscaler, GroupTick, ScalingDecision, ScalingState, ScalingTrigger, TickReport,
    HISTORY_CAPACITY,
};
pub use profile::GroupResourceProfile;
pub use state::{GroupLimitStore, GroupLimits};

/// Thresholds and pacing of the autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Time a group is left alone after a change.
    pub cooldown: Duration,
    /// Change in parallelism per decision.
    pub step: usize,
    /// Fraction of available memory kept free when scaling up.
    pub safety_margin: f64,
    /// Scale up only while cpu load is below this fraction.
    pub scale_up_cpu_below: f64,
    /// Scale up only while available memory is above this fraction.
    pub scale_up_memory_above: f64,
    /// Scale down when cpu load is above this fraction.
    pub scale_down_cpu_above: f64,
    /// Scale down when available memory is below this fraction.
    pub scale_down_memory_below: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            step: 2,
            safety_margin: 0.2,
            scale_up_cpu_below: 0.4,
            scale_up_memory_above: 0.4,
            scale_down_cpu_above: 0.8,
            scale_down_memory_below: 0.2,
        }
    }
}

impl ScalingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Builder method to set the cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Builder method to set the step size.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Builder method to set the safety margin.
    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Validates the policy values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.step == 0 {
            return Err(ConfigError::ValidationFailed(
                "scaling step must be greater than 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(ConfigError::ValidationFailed(
                "safety_margin must be in [0.0, 1.0)".to_string(),
            ));
        }

        for (name, value) in [
            ("scale_up_cpu_below", self.scale_up_cpu_below),
            ("scale_up_memory_above", self.scale_up_memory_above),
            ("scale_down_cpu_above", self.scale_down_cpu_above),
            ("scale_down_memory_below", self.scale_down_memory_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if self.scale_up_cpu_below > self.scale_down_cpu_above {
            return Err(ConfigError::ValidationFailed(
                "scale_up_cpu_below cannot exceed scale_down_cpu_above".to_string(),
            ));
        }

        if self.scale_up_memory_above < self.scale_down_memory_below {
            return Err(ConfigError::ValidationFailed(
                "scale_up_memory_above cannot be below scale_down_memory_below".to_string(),
            ));
        }

        Ok(())
    }
}
