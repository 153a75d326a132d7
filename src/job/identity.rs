//! Parameterized job identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a parameterized job: its family plus every parameter value.
///
/// Two identities are equal when the family and every `(name, value)` pair
/// match. Parameters are kept sorted by name so insertion order never
/// affects equality or hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    /// Job family (e.g. "ingest", "postprocess").
    pub family: String,
    /// Parameter values keyed by name.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl JobIdentity {
    /// Creates an identity with no parameters.
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Adds or replaces a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(name.into(), value.to_string());
        self
    }

    /// Returns the value of a parameter, if present.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Human-readable label, e.g. `ingest(threshold=250, year=2024)`.
    pub fn label(&self) -> String {
        if self.parameters.is_empty() {
            return self.family.clone();
        }

        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        format!("{}({})", self.family, params.join(", "))
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
