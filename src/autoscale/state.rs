//! Current group limits: shared read view and on-disk copy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::atomic_write;
use crate::error::CheckpointError;

/// File name of the persisted limits inside the state directory.
pub const GROUP_LIMITS_FILE: &str = "group_limits.json";

/// Read-only view of the current parallelism of every group.
///
/// Clones share the same underlying map. Only the autoscaler writes.
#[derive(Debug, Clone, Default)]
pub struct GroupLimits {
    inner: Arc<RwLock<BTreeMap<String, usize>>>,
}

impl GroupLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current limit of `group`.
    pub fn get(&self, group: &str) -> Option<usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .copied()
    }

    /// Copy of all limits.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, group: &str, limit: usize) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.to_string(), limit);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLimits {
    updated_at: DateTime<Utc>,
    limits: BTreeMap<String, usize>,
}

/// `group_limits.json` in the state directory, replaced atomically.
#[derive(Debug, Clone)]
pub struct GroupLimitStore {
    path: PathBuf,
}

impl GroupLimitStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(GROUP_LIMITS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads persisted limits. A missing file yields an empty map.
    pub async fn load(&self) -> Result<BTreeMap<String, usize>, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                let persisted: PersistedLimits = serde_json::from_slice(&data)?;
                Ok(persisted.limits)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }

    pub async fn save(&self, limits: &BTreeMap<String, usize>) -> Result<(), CheckpointError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let persisted = PersistedLimits {
            updated_at: Utc::now(),
            limits: limits.clone(),
        };
        let data = serde_json::to_vec_pretty(&persisted)?;
        atomic_write(&self.path, &data).await?;

        debug!(path = ?self.path, groups = limits.len(), "Group limits persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let limits = GroupLimits::new();
        let view = limits.clone();

        limits.set("batch", 4);
        assert_eq!(view.get("batch"), Some(4));
        assert_eq!(view.get("other"), None);
        assert_eq!(view.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = GroupLimitStore::new(dir.path().join("state"));

        assert!(store.load().await.expect("load").is_empty());

        let mut limits = BTreeMap::new();
        limits.insert("batch".to_string(), 6);
        limits.insert("report".to_string(), 1);
        store.save(&limits).await.expect("save");

        assert_eq!(store.load().await.expect("load"), limits);
        assert!(store.path().ends_with(GROUP_LIMITS_FILE));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = GroupLimitStore::new(dir.path());
        tokio::fs::write(store.path(), b"{not json").await.expect("write");

        assert!(matches!(store.load().await, Err(CheckpointError::Json(_))));
    }
}
