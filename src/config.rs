//! Coordinator configuration.
//!
//! Configuration comes from a YAML file (groups, families, thresholds) with
//! `JOBWARDEN_*` environment variables overriding scalar settings.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autoscale::{GroupResourceProfile, ScalingPolicy};
use crate::checkpoint::{build_key, KeyRegistry, ParameterKeyBuilder};
use crate::job::StaticEnvironment;
use crate::limits::MemoryCapPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Key schema, resolved defaults and memory override of one job family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    /// Parameters that distinguish concurrently runnable jobs, in key order.
    ///
    /// When empty, every parameter of the job is part of its key.
    #[serde(default)]
    pub differentiating: Vec<String>,
    /// Resolved environment defaults.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Fixed memory limit for every job of the family, in MiB.
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

impl FamilyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            differentiating: Vec::new(),
            defaults: BTreeMap::new(),
            memory_limit_mb: None,
        }
    }

    pub fn with_differentiating<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.differentiating = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.defaults.insert(name.into(), value.to_string());
        self
    }
}

/// Configuration for the coordinator and its loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    // Storage settings
    /// Directory holding checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Directory holding coordinator state (`group_limits.json`).
    pub state_dir: PathBuf,

    // Queue settings
    /// Redis URL of the queue daemon. Unused in dry-run mode.
    pub redis_url: Option<String>,
    /// Key prefix of the queue in Redis.
    pub queue_name: String,
    /// Use the in-memory queue instead of Redis.
    pub dry_run: bool,

    // Autoscaler settings
    pub tick_interval_secs: u64,
    pub cooldown_secs: u64,
    pub scale_step: usize,
    /// Fraction of available memory kept free when scaling up.
    pub safety_margin: f64,
    pub scale_up_cpu_below: f64,
    pub scale_up_memory_above: f64,
    pub scale_down_cpu_above: f64,
    pub scale_down_memory_below: f64,

    // Probe settings
    pub probe_timeout_ms: u64,
    /// procfs mount point.
    pub proc_root: PathBuf,
    /// cgroup v2 mount point for per-group footprints.
    pub cgroup_root: Option<PathBuf>,

    // Guard settings
    pub guard_timeout_ms: u64,
    pub reservation_ttl_secs: u64,

    // Dependency watcher
    pub watch_interval_secs: u64,

    /// Multiplier applied to per-job memory estimates.
    pub headroom_factor: f64,

    pub groups: Vec<GroupResourceProfile>,
    pub families: Vec<FamilyConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let policy = ScalingPolicy::default();
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            state_dir: PathBuf::from("./state"),

            redis_url: None,
            queue_name: "jobwarden".to_string(),
            dry_run: false,

            tick_interval_secs: policy.tick_interval.as_secs(),
            cooldown_secs: policy.cooldown.as_secs(),
            scale_step: policy.step,
            safety_margin: policy.safety_margin,
            scale_up_cpu_below: policy.scale_up_cpu_below,
            scale_up_memory_above: policy.scale_up_memory_above,
            scale_down_cpu_above: policy.scale_down_cpu_above,
            scale_down_memory_below: policy.scale_down_memory_below,

            probe_timeout_ms: 5_000,
            proc_root: PathBuf::from("/proc"),
            cgroup_root: None,

            guard_timeout_ms: 5_000,
            reservation_ttl_secs: 30,

            watch_interval_secs: 10,

            headroom_factor: crate::limits::DEFAULT_HEADROOM_FACTOR,

            groups: Vec::new(),
            families: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables only.
    ///
    /// # Environment Variables
    ///
    /// - `JOBWARDEN_CHECKPOINT_DIR`: Checkpoint directory (default: ./checkpoints)
    /// - `JOBWARDEN_STATE_DIR`: State directory (default: ./state)
    /// - `JOBWARDEN_REDIS_URL`: Queue daemon Redis URL
    /// - `JOBWARDEN_QUEUE_NAME`: Queue key prefix (default: jobwarden)
    /// - `JOBWARDEN_DRY_RUN`: Use the in-memory queue (default: false)
    /// - `JOBWARDEN_TICK_INTERVAL_SECS`: Autoscaler tick (default: 60)
    /// - `JOBWARDEN_COOLDOWN_SECS`: Cooldown after a change (default: 300)
    /// - `JOBWARDEN_SCALE_STEP`: Parallelism change per decision (default: 2)
    /// - `JOBWARDEN_SAFETY_MARGIN`: Memory kept free on scale-up (default: 0.2)
    /// - `JOBWARDEN_PROBE_TIMEOUT_MS`: Resource probe timeout (default: 5000)
    /// - `JOBWARDEN_PROC_ROOT`: procfs mount point (default: /proc)
    /// - `JOBWARDEN_CGROUP_ROOT`: cgroup v2 mount point
    /// - `JOBWARDEN_GUARD_TIMEOUT_MS`: Duplicate guard timeout (default: 5000)
    /// - `JOBWARDEN_RESERVATION_TTL_SECS`: Guard reservation lifetime (default: 30)
    /// - `JOBWARDEN_WATCH_INTERVAL_SECS`: Dependency poll interval (default: 10)
    /// - `JOBWARDEN_HEADROOM_FACTOR`: Memory cap multiplier (default: 1.0)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file, then applies environment overrides.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML without environment overrides or validation.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage settings
        if let Some(val) = lookup("JOBWARDEN_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("JOBWARDEN_STATE_DIR") {
            self.state_dir = PathBuf::from(val);
        }

        // Queue settings
        if let Some(val) = lookup("JOBWARDEN_REDIS_URL") {
            self.redis_url = Some(val);
        }

        if let Some(val) = lookup("JOBWARDEN_QUEUE_NAME") {
            self.queue_name = val;
        }

        if let Some(val) = lookup("JOBWARDEN_DRY_RUN") {
            self.dry_run = parse_env_bool(&val, "JOBWARDEN_DRY_RUN")?;
        }

        // Autoscaler settings
        if let Some(val) = lookup("JOBWARDEN_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = parse_env_value(&val, "JOBWARDEN_TICK_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_COOLDOWN_SECS") {
            self.cooldown_secs = parse_env_value(&val, "JOBWARDEN_COOLDOWN_SECS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_SCALE_STEP") {
            self.scale_step = parse_env_value(&val, "JOBWARDEN_SCALE_STEP")?;
        }

        if let Some(val) = lookup("JOBWARDEN_SAFETY_MARGIN") {
            self.safety_margin = parse_env_value(&val, "JOBWARDEN_SAFETY_MARGIN")?;
        }

        // Probe settings
        if let Some(val) = lookup("JOBWARDEN_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse_env_value(&val, "JOBWARDEN_PROBE_TIMEOUT_MS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_PROC_ROOT") {
            self.proc_root = PathBuf::from(val);
        }

        if let Some(val) = lookup("JOBWARDEN_CGROUP_ROOT") {
            self.cgroup_root = Some(PathBuf::from(val));
        }

        // Guard settings
        if let Some(val) = lookup("JOBWARDEN_GUARD_TIMEOUT_MS") {
            self.guard_timeout_ms = parse_env_value(&val, "JOBWARDEN_GUARD_TIMEOUT_MS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_RESERVATION_TTL_SECS") {
            self.reservation_ttl_secs = parse_env_value(&val, "JOBWARDEN_RESERVATION_TTL_SECS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_WATCH_INTERVAL_SECS") {
            self.watch_interval_secs = parse_env_value(&val, "JOBWARDEN_WATCH_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("JOBWARDEN_HEADROOM_FACTOR") {
            self.headroom_factor = parse_env_value(&val, "JOBWARDEN_HEADROOM_FACTOR")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_dir cannot be empty".to_string(),
            ));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "state_dir cannot be empty".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.probe_timeout_ms == 0 || self.guard_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "probe and guard timeouts must be greater than 0".to_string(),
            ));
        }

        if self.watch_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "watch_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.headroom_factor <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "headroom_factor must be greater than 0".to_string(),
            ));
        }

        self.scaling_policy().validate()?;

        let mut group_names = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !group_names.insert(group.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "group '{}' is defined more than once",
                    group.name
                )));
            }
        }

        let mut family_names = HashSet::new();
        for family in &self.families {
            build_key::<&str, &str>(&family.name, &[])
                .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;
            if !family_names.insert(family.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "family '{}' is defined more than once",
                    family.name
                )));
            }
            if family.memory_limit_mb == Some(0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "family '{}': memory_limit_mb must be greater than 0",
                    family.name
                )));
            }
        }

        Ok(())
    }

    /// Redis URL of the queue daemon.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when no URL is configured.
    pub fn require_redis_url(&self) -> Result<&str, ConfigError> {
        self.redis_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("JOBWARDEN_REDIS_URL".to_string()))
    }

    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            step: self.scale_step,
            safety_margin: self.safety_margin,
            scale_up_cpu_below: self.scale_up_cpu_below,
            scale_up_memory_above: self.scale_up_memory_above,
            scale_down_cpu_above: self.scale_down_cpu_above,
            scale_down_memory_below: self.scale_down_memory_below,
        }
    }

    /// Key schemas of the families that declare differentiating parameters.
    ///
    /// Families without a schema key on all of their parameters.
    pub fn key_registry(&self) -> KeyRegistry {
        self.families
            .iter()
            .filter(|family| !family.differentiating.is_empty())
            .fold(KeyRegistry::new(), |registry, family| {
                registry.with(
                    ParameterKeyBuilder::new(family.name.clone())
                        .differentiating(family.differentiating.iter().cloned()),
                )
            })
    }

    /// Resolved environment defaults of every configured family.
    pub fn environment(&self) -> StaticEnvironment {
        let mut environment = StaticEnvironment::new();
        for family in self.families.iter().filter(|f| !f.defaults.is_empty()) {
            environment.set_family(family.name.clone(), family.defaults.clone());
        }
        environment
    }

    pub fn memory_policy(&self) -> MemoryCapPolicy {
        self.families
            .iter()
            .filter_map(|f| f.memory_limit_mb.map(|mb| (f.name.clone(), mb)))
            .fold(
                MemoryCapPolicy::new().with_headroom_factor(self.headroom_factor),
                |policy, (family, mb)| policy.with_family_override(family, mb),
            )
    }

    pub fn profile(&self, group: &str) -> Option<&GroupResourceProfile> {
        self.groups.iter().find(|g| g.name == group)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_timeout_ms)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    /// Builder method to set the checkpoint directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Builder method to set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Builder method to add a group.
    pub fn with_group(mut self, profile: GroupResourceProfile) -> Self {
        self.groups.push(profile);
        self
    }

    /// Builder method to add a family.
    pub fn with_family(mut self, family: FamilyConfig) -> Self {
        self.families.push(family);
        self
    }

    /// Builder method to enable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
