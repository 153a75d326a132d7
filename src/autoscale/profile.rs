//! Static resource profiles of job groups.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Immutable resource profile of a group of jobs.
///
/// The current parallelism of a group is not part of the profile; it is
/// owned by the autoscaler and starts at `initial_parallelism`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResourceProfile {
    /// Group name, as known to the queue daemon.
    pub name: String,
    /// Lowest parallelism the autoscaler may set.
    pub min_parallelism: usize,
    /// Highest parallelism the autoscaler may set.
    pub max_parallelism: usize,
    /// Parallelism before any scaling decision. Defaults to `min_parallelism`.
    #[serde(default)]
    pub initial_parallelism: Option<usize>,
    /// Estimated peak memory of one job, in MiB.
    pub per_job_memory_mb: u64,
}

impl GroupResourceProfile {
    /// Creates a validated profile.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if the name is empty, the
    /// bounds are not `1 <= min <= max`, or the memory estimate is zero.
    pub fn new(
        name: impl Into<String>,
        min_parallelism: usize,
        max_parallelism: usize,
        per_job_memory_mb: u64,
    ) -> Result<Self, ConfigError> {
        let profile = Self {
            name: name.into(),
            min_parallelism,
            max_parallelism,
            initial_parallelism: None,
            per_job_memory_mb,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Sets the starting parallelism and re-validates.
    pub fn with_initial(mut self, initial: usize) -> Result<Self, ConfigError> {
        self.initial_parallelism = Some(initial);
        self.validate()?;
        Ok(self)
    }

    /// Parallelism the group starts with.
    pub fn initial(&self) -> usize {
        self.initial_parallelism.unwrap_or(self.min_parallelism)
    }

    /// Per-job memory estimate in bytes.
    pub fn per_job_memory_bytes(&self) -> u64 {
        self.per_job_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Clamps `limit` into `[min_parallelism, max_parallelism]`.
    pub fn clamp(&self, limit: usize) -> usize {
        limit.clamp(self.min_parallelism, self.max_parallelism)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "group name cannot be empty".to_string(),
            ));
        }

        if self.min_parallelism == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "group '{}': min_parallelism must be at least 1",
                self.name
            )));
        }

        if self.min_parallelism > self.max_parallelism {
            return Err(ConfigError::ValidationFailed(format!(
                "group '{}': min_parallelism ({}) cannot exceed max_parallelism ({})",
                self.name, self.min_parallelism, self.max_parallelism
            )));
        }

        if let Some(initial) = self.initial_parallelism {
            if !(self.min_parallelism..=self.max_parallelism).contains(&initial) {
                return Err(ConfigError::ValidationFailed(format!(
                    "group '{}': initial_parallelism ({}) must be within [{}, {}]",
                    self.name, initial, self.min_parallelism, self.max_parallelism
                )));
            }
        }

        if self.per_job_memory_mb == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "group '{}': per_job_memory_mb must be greater than 0",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_profile() {
        let profile = GroupResourceProfile::new("batch", 1, 8, 512).expect("valid");
        assert_eq!(profile.initial(), 1);
        assert_eq!(profile.per_job_memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_initial_parallelism() {
        let profile = GroupResourceProfile::new("batch", 1, 8, 512)
            .and_then(|p| p.with_initial(2))
            .expect("valid");
        assert_eq!(profile.initial(), 2);

        let err = GroupResourceProfile::new("batch", 1, 8, 512)
            .and_then(|p| p.with_initial(9))
            .unwrap_err();
        assert!(err.to_string().contains("initial_parallelism"));
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(GroupResourceProfile::new("batch", 0, 8, 512).is_err());
        let err = GroupResourceProfile::new("batch", 5, 4, 512).unwrap_err();
        assert!(err.to_string().contains("cannot exceed"));
    }

    #[test]
    fn test_empty_name_and_zero_memory() {
        assert!(GroupResourceProfile::new("", 1, 2, 512).is_err());
        let err = GroupResourceProfile::new("batch", 1, 2, 0).unwrap_err();
        assert!(err.to_string().contains("per_job_memory_mb"));
    }

    #[test]
    fn test_clamp() {
        let profile = GroupResourceProfile::new("batch", 2, 6, 256).expect("valid");
        assert_eq!(profile.clamp(0), 2);
        assert_eq!(profile.clamp(4), 4);
        assert_eq!(profile.clamp(100), 6);
    }

    #[test]
    fn test_yaml_profile() {
        let yaml = "name: batch\nmin_parallelism: 1\nmax_parallelism: 8\ninitial_parallelism: 2\nper_job_memory_mb: 1024\n";
        let profile: GroupResourceProfile = serde_yaml::from_str(yaml).expect("parse");
        assert!(profile.validate().is_ok());
        assert_eq!(profile.initial(), 2);
    }
}
