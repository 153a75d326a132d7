//! Resolved environment defaults for job parameters.
//!
//! The environment provider is the single source of truth for parameters
//! such as tool versions or data roots. A submitter that passes a different
//! value for one of these parameters is violating policy: the violation is
//! logged and the provider's value is kept.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::identity::JobIdentity;

/// Source of resolved default parameters per job family.
pub trait EnvironmentProvider: Send + Sync {
    /// Returns the resolved defaults for `family` (empty when none apply).
    fn defaults(&self, family: &str) -> BTreeMap<String, String>;
}

/// Defaults loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticEnvironment {
    families: HashMap<String, BTreeMap<String, String>>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a default value for one parameter of a family.
    pub fn with_default(
        mut self,
        family: impl Into<String>,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.families
            .entry(family.into())
            .or_default()
            .insert(name.into(), value.to_string());
        self
    }

    /// Replaces all defaults of a family.
    pub fn set_family(&mut self, family: impl Into<String>, defaults: BTreeMap<String, String>) {
        self.families.insert(family.into(), defaults);
    }
}

impl EnvironmentProvider for StaticEnvironment {
    fn defaults(&self, family: &str) -> BTreeMap<String, String> {
        self.families.get(family).cloned().unwrap_or_default()
    }
}

/// A submitted parameter value that disagreed with the resolved default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub parameter: String,
    pub submitted: String,
    pub resolved: String,
}

/// Identity after defaults were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub identity: JobIdentity,
    pub violations: Vec<PolicyViolation>,
}

/// Applies the provider's defaults to `identity`.
///
/// Missing parameters are filled in. Parameters that override a default are
/// reported as violations and reset to the default.
pub fn resolve(provider: &dyn EnvironmentProvider, identity: &JobIdentity) -> Resolved {
    let mut resolved = identity.clone();
    let mut violations = Vec::new();

    for (name, default) in provider.defaults(&identity.family) {
        match resolved.parameters.get(&name) {
            Some(submitted) if *submitted != default => {
                warn!(
                    job = %identity,
                    parameter = %name,
                    submitted = %submitted,
                    resolved = %default,
                    "Per-job override of an environment default ignored"
                );
                violations.push(PolicyViolation {
                    parameter: name.clone(),
                    submitted: submitted.clone(),
                    resolved: default.clone(),
                });
                resolved.parameters.insert(name, default);
            }
            Some(_) => {}
            None => {
                resolved.parameters.insert(name, default);
            }
        }
    }

    Resolved {
        identity: resolved,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticEnvironment {
        StaticEnvironment::new()
            .with_default("ingest", "toolchain", "2.4.1")
            .with_default("ingest", "data_root", "/srv/data")
    }

    #[test]
    fn test_missing_defaults_are_filled() {
        let identity = JobIdentity::new("ingest").with_param("year", 2024);
        let resolved = resolve(&provider(), &identity);

        assert!(resolved.violations.is_empty());
        assert_eq!(resolved.identity.param("toolchain"), Some("2.4.1"));
        assert_eq!(resolved.identity.param("data_root"), Some("/srv/data"));
        assert_eq!(resolved.identity.param("year"), Some("2024"));
    }

    #[test]
    fn test_override_is_reported_and_default_wins() {
        let identity = JobIdentity::new("ingest")
            .with_param("year", 2024)
            .with_param("toolchain", "3.0.0");
        let resolved = resolve(&provider(), &identity);

        assert_eq!(
            resolved.violations,
            vec![PolicyViolation {
                parameter: "toolchain".to_string(),
                submitted: "3.0.0".to_string(),
                resolved: "2.4.1".to_string(),
            }]
        );
        assert_eq!(resolved.identity.param("toolchain"), Some("2.4.1"));
    }

    #[test]
    fn test_matching_value_is_not_a_violation() {
        let identity = JobIdentity::new("ingest").with_param("toolchain", "2.4.1");
        let resolved = resolve(&provider(), &identity);

        assert!(resolved.violations.is_empty());
    }

    #[test]
    fn test_unknown_family_passes_through() {
        let identity = JobIdentity::new("export").with_param("format", "csv");
        let resolved = resolve(&provider(), &identity);

        assert_eq!(resolved.identity, identity);
        assert!(resolved.violations.is_empty());
    }

    #[test]
    fn test_static_environment_from_yaml() {
        let yaml = "ingest:\n  toolchain: \"2.4.1\"\n";
        let env: StaticEnvironment = serde_yaml::from_str(yaml).expect("yaml should parse");

        assert_eq!(
            env.defaults("ingest").get("toolchain").map(String::as_str),
            Some("2.4.1")
        );
    }
}
