//! Error types for jobwarden operations.
//!
//! Defines error types for the subsystems that can fail on caller misuse or
//! on I/O:
//! - Checkpoint key derivation
//! - Checkpoint persistence
//! - Dependency graph construction and transitions
//! - Host resource probing
//!
//! Queue, configuration and coordinator errors live next to the code that
//! raises them (`queue::QueueError`, `config::ConfigError`,
//! `coordinator::CoordinatorError`).

use std::time::Duration;

use thiserror::Error;

/// Errors raised while deriving a checkpoint key.
///
/// Always a caller bug: the operation is aborted and nothing is submitted.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid parameter for family '{family}': {reason}")]
    InvalidParameter { family: String, reason: String },
}

impl KeyError {
    pub(crate) fn invalid(family: &str, reason: impl Into<String>) -> Self {
        KeyError::InvalidParameter {
            family: family.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint '{0}' not found")]
    NotFound(String),

    #[error("Invalid checkpoint key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while building or updating a dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cyclic dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Job '{0}' is not part of the dependency graph")]
    UnknownJob(String),

    #[error("Job '{0}' was added to the dependency graph twice")]
    DuplicateJob(String),

    #[error("Invalid transition for job '{job}' from {from} to {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },
}

/// Errors that can occur while sampling host resources.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Host probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Host probe unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse host statistics: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_lists_path() {
        let err = GraphError::CyclicDependency(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_key_error_display() {
        let err = KeyError::invalid("ingest", "missing differentiating parameter 'year'");
        let msg = err.to_string();
        assert!(msg.contains("ingest"));
        assert!(msg.contains("year"));
    }

    #[test]
    fn test_probe_timeout_display() {
        let err = ProbeError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }
}
