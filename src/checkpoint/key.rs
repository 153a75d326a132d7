//! Canonical checkpoint keys.
//!
//! A checkpoint key is built from the job family and the values of every
//! differentiating parameter, in schema order:
//!
//! ```text
//! ingest:250:2024
//! ^^^^^^ ^^^ ^^^^
//! family  threshold  year
//! ```
//!
//! Each component is percent-encoded, so a value containing the `:`
//! separator (or `%`) can never make two different parameter tuples produce
//! the same key. Plain alphanumeric values are left untouched.
//!
//! Families without a registered schema key on every parameter, each
//! component written as `name=value`:
//!
//! ```text
//! export:day=1:region=eu
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::job::JobIdentity;

/// Separator between key components.
pub const KEY_SEPARATOR: char = ':';

/// File extension of checkpoint files.
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

static FAMILY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("Invalid regex for family names")
});

/// Canonical identity string of one parameterized job instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// File name of the checkpoint stored under this key.
    pub fn file_name(&self) -> String {
        format!("{}.{}", urlencoding::encode(&self.0), CHECKPOINT_EXTENSION)
    }

    /// Recovers a key from a checkpoint file name.
    ///
    /// Returns `None` for anything that is not a checkpoint file.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.starts_with('.') {
            return None;
        }
        let encoded = name.strip_suffix(&format!(".{}", CHECKPOINT_EXTENSION))?;
        let decoded = urlencoding::decode(encoded).ok()?;
        Some(Self(decoded.into_owned()))
    }

    /// Wraps a key string previously produced by a builder.
    ///
    /// Used when a key arrives from outside (CLI, queue payloads).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_family(family: &str) -> Result<(), KeyError> {
    if family.is_empty() {
        return Err(KeyError::invalid(family, "family name cannot be empty"));
    }
    if !FAMILY_PATTERN.is_match(family) {
        return Err(KeyError::invalid(
            family,
            "family name may only contain alphanumerics, '_', '.' and '-'",
        ));
    }
    Ok(())
}

fn join_components<'a>(family: &str, values: impl Iterator<Item = &'a str>) -> CheckpointKey {
    let mut key = urlencoding::encode(family).into_owned();
    for value in values {
        key.push(KEY_SEPARATOR);
        key.push_str(&urlencoding::encode(value));
    }
    CheckpointKey(key)
}

/// Builds a key treating every listed parameter as differentiating.
///
/// Parameter order is significant and must be the same for every job of a
/// family. Duplicate or empty parameter names are rejected.
pub fn build_key<N, V>(family: &str, parameters: &[(N, V)]) -> Result<CheckpointKey, KeyError>
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    validate_family(family)?;

    let mut seen = HashSet::new();
    for (name, _) in parameters {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(KeyError::invalid(family, "parameter name cannot be empty"));
        }
        if !seen.insert(name) {
            return Err(KeyError::invalid(
                family,
                format!("parameter '{}' given more than once", name),
            ));
        }
    }

    Ok(join_components(
        family,
        parameters.iter().map(|(_, value)| value.as_ref()),
    ))
}

/// Key schema for one job family.
///
/// Declares which parameters differentiate concurrently runnable jobs.
/// Parameters outside the schema do not contribute to the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterKeyBuilder {
    family: String,
    differentiating: Vec<String>,
}

impl ParameterKeyBuilder {
    /// Creates a schema with no differentiating parameters (a singleton family).
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            differentiating: Vec::new(),
        }
    }

    /// Sets the differentiating parameters, in key order.
    pub fn differentiating<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.differentiating = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn differentiating_parameters(&self) -> &[String] {
        &self.differentiating
    }

    /// Builds the key from a parameter map.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidParameter` when a differentiating parameter
    /// is missing, or when the schema itself is malformed.
    pub fn build(&self, parameters: &BTreeMap<String, String>) -> Result<CheckpointKey, KeyError> {
        let mut ordered = Vec::with_capacity(self.differentiating.len());
        for name in &self.differentiating {
            let value = parameters.get(name).ok_or_else(|| {
                KeyError::invalid(
                    &self.family,
                    format!("missing differentiating parameter '{}'", name),
                )
            })?;
            ordered.push((name.as_str(), value.as_str()));
        }
        build_key(&self.family, &ordered)
    }

    /// Builds the key for a job identity of this family.
    pub fn build_for(&self, identity: &JobIdentity) -> Result<CheckpointKey, KeyError> {
        if identity.family != self.family {
            return Err(KeyError::invalid(
                &identity.family,
                format!("key schema belongs to family '{}'", self.family),
            ));
        }
        self.build(&identity.parameters)
    }
}

/// Builds a key naming every parameter, for families without a schema.
///
/// Names and values are both percent-encoded, so `=` and `:` inside either
/// cannot shift a component boundary.
pub fn build_named_key<N, V>(
    family: &str,
    parameters: &[(N, V)],
) -> Result<CheckpointKey, KeyError>
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    build_key(family, parameters)?;

    let components: Vec<String> = parameters
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name.as_ref()),
                urlencoding::encode(value.as_ref())
            )
        })
        .collect();

    let mut key = urlencoding::encode(family).into_owned();
    for component in components {
        key.push(KEY_SEPARATOR);
        key.push_str(&component);
    }
    Ok(CheckpointKey(key))
}

/// Family name to key schema lookup.
///
/// A family without a registered schema treats every parameter of the
/// identity as differentiating, keyed by name as well as value.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    builders: HashMap<String, ParameterKeyBuilder>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the schema of a family.
    pub fn register(&mut self, builder: ParameterKeyBuilder) {
        self.builders.insert(builder.family.clone(), builder);
    }

    pub fn with(mut self, builder: ParameterKeyBuilder) -> Self {
        self.register(builder);
        self
    }

    pub fn get(&self, family: &str) -> Option<&ParameterKeyBuilder> {
        self.builders.get(family)
    }

    /// Derives the checkpoint key of an identity.
    pub fn key_for(&self, identity: &JobIdentity) -> Result<CheckpointKey, KeyError> {
        match self.builders.get(&identity.family) {
            Some(builder) => builder.build_for(identity),
            None => {
                let ordered: Vec<(&str, &str)> = identity
                    .parameters
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str()))
                    .collect();
                build_named_key(&identity.family, &ordered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_builder() -> ParameterKeyBuilder {
        ParameterKeyBuilder::new("ingest").differentiating(["threshold", "year"])
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scenario_keys() {
        let builder = ingest_builder();
        let a = builder
            .build(&params(&[("threshold", "250"), ("year", "2024")]))
            .expect("key should build");
        let b = builder
            .build(&params(&[("threshold", "500"), ("year", "2024")]))
            .expect("key should build");

        assert_eq!(a.as_str(), "ingest:250:2024");
        assert_eq!(b.as_str(), "ingest:500:2024");
        assert_ne!(a, b);
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = ingest_builder();
        let p = params(&[("threshold", "250"), ("year", "2024")]);
        assert_eq!(builder.build(&p).ok(), builder.build(&p).ok());
    }

    #[test]
    fn test_missing_differentiating_parameter_is_rejected() {
        let err = ingest_builder()
            .build(&params(&[("threshold", "250")]))
            .expect_err("missing year must fail");

        assert!(matches!(err, KeyError::InvalidParameter { .. }));
        assert!(err.to_string().contains("year"));
    }

    #[test]
    fn test_non_differentiating_parameters_do_not_affect_key() {
        let builder = ingest_builder();
        let a = builder
            .build(&params(&[("threshold", "250"), ("year", "2024"), ("verbose", "1")]))
            .expect("key should build");
        let b = builder
            .build(&params(&[("threshold", "250"), ("year", "2024")]))
            .expect("key should build");

        assert_eq!(a, b);
    }

    #[test]
    fn test_separator_inside_values_cannot_collide() {
        let a = build_key("ingest", &[("a", "x:y"), ("b", "z")]).expect("key should build");
        let b = build_key("ingest", &[("a", "x"), ("b", "y:z")]).expect("key should build");

        assert_ne!(a, b);
        assert_eq!(a.as_str(), "ingest:x%3Ay:z");
    }

    #[test]
    fn test_percent_in_values_cannot_collide() {
        let a = build_key("ingest", &[("a", "%3A")]).expect("key should build");
        let b = build_key("ingest", &[("a", ":")]).expect("key should build");

        assert_ne!(a, b);
    }

    #[test]
    fn test_distinct_tuples_give_distinct_keys() {
        let builder = ingest_builder();
        let values = ["", "0", "1", "a:b", "a", "b", "2024", "%", "a b"];
        let mut keys = HashSet::new();
        let mut tuples = 0;

        for threshold in values {
            for year in values {
                tuples += 1;
                let key = builder
                    .build(&params(&[("threshold", threshold), ("year", year)]))
                    .expect("key should build");
                keys.insert(key);
            }
        }

        assert_eq!(keys.len(), tuples);
    }

    #[test]
    fn test_invalid_family_is_rejected() {
        assert!(build_key::<&str, &str>("", &[]).is_err());
        assert!(build_key::<&str, &str>("in:gest", &[]).is_err());
        assert!(build_key::<&str, &str>("in gest", &[]).is_err());
        assert!(build_key::<&str, &str>("ingest-v2.1", &[]).is_ok());
    }

    #[test]
    fn test_duplicate_parameter_names_are_rejected() {
        let err = build_key("ingest", &[("year", "2024"), ("year", "2025")])
            .expect_err("duplicate names must fail");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_build_for_checks_family() {
        let identity = JobIdentity::new("export")
            .with_param("threshold", 250)
            .with_param("year", 2024);
        assert!(ingest_builder().build_for(&identity).is_err());
    }

    #[test]
    fn test_registry_fallback_uses_all_parameters() {
        let registry = KeyRegistry::new().with(ingest_builder());

        let registered = JobIdentity::new("ingest")
            .with_param("year", 2024)
            .with_param("threshold", 250)
            .with_param("verbose", "yes");
        assert_eq!(
            registry.key_for(&registered).expect("key").as_str(),
            "ingest:250:2024"
        );

        let unregistered = JobIdentity::new("export")
            .with_param("format", "csv")
            .with_param("day", 3);
        assert_eq!(
            registry.key_for(&unregistered).expect("key").as_str(),
            "export:day=3:format=csv"
        );
    }

    #[test]
    fn test_fallback_key_includes_parameter_names() {
        let registry = KeyRegistry::new();
        let by_region = JobIdentity::new("export")
            .with_param("day", 1)
            .with_param("region", "eu");
        let by_shard = JobIdentity::new("export")
            .with_param("day", 1)
            .with_param("shard", "eu");

        assert_ne!(
            registry.key_for(&by_region).expect("key"),
            registry.key_for(&by_shard).expect("key")
        );
    }

    #[test]
    fn test_fallback_distinct_identities_give_distinct_keys() {
        let registry = KeyRegistry::new();
        let names = ["a", "b", "a=b", "a:b"];
        let values = ["", "1", "=", ":", "1=2", "1:2"];
        let mut identities = Vec::new();

        identities.push(JobIdentity::new("export"));
        for name in names {
            for value in values {
                identities.push(JobIdentity::new("export").with_param(name, value));
                for other in names {
                    if other <= name {
                        continue;
                    }
                    identities.push(
                        JobIdentity::new("export")
                            .with_param(name, value)
                            .with_param(other, value),
                    );
                }
            }
        }

        let mut keys = HashSet::new();
        for identity in &identities {
            keys.insert(registry.key_for(identity).expect("key should build"));
        }
        assert_eq!(keys.len(), identities.len());
    }

    #[test]
    fn test_named_key_escapes_names_and_values() {
        let key = build_named_key("export", &[("a=b", "c"), ("a", "b=c")]).expect("key");
        assert_eq!(key.as_str(), "export:a%3Db=c:a=b%3Dc");
    }

    #[test]
    fn test_file_name_roundtrip() {
        let key = build_key("ingest", &[("a", "x:y"), ("b", "50%")]).expect("key");
        let name = key.file_name();

        assert!(name.ends_with(".ckpt"));
        assert!(!name.contains('/'));
        assert_eq!(CheckpointKey::from_file_name(&name), Some(key));
    }

    #[test]
    fn test_from_file_name_skips_non_checkpoints() {
        assert_eq!(CheckpointKey::from_file_name(".ingest.ckpt.1234.tmp"), None);
        assert_eq!(CheckpointKey::from_file_name("notes.txt"), None);
        assert_eq!(CheckpointKey::from_file_name(".hidden.ckpt"), None);
    }
}
