//! File-backed checkpoint storage with atomic replace.
//!
//! One file per checkpoint key lives in the store directory. Writes go to a
//! hidden temporary file in the same directory, are flushed with `sync_all`,
//! and are then renamed over the final path, so a reader sees either the
//! previous payload or the new one and never a partial write.
//!
//! Writers to different keys never coordinate. Writers to the same key race
//! at the rename and the last rename wins; callers prevent that with the
//! concurrency guard. When two same-key writes overlap inside this process
//! the store reports the race (log, metric, receipt flag) but does not fail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::key::CheckpointKey;
use crate::error::CheckpointError;
use crate::metrics::MetricsCollector;

/// Suffix of in-progress temporary files.
const TEMP_SUFFIX: &str = ".tmp";

/// Longest checkpoint file name accepted; leaves room for the temp-file decoration.
const MAX_FILE_NAME_BYTES: usize = 200;

/// Result of a successful checkpoint write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    /// Key that was written.
    pub key: CheckpointKey,
    /// Payload size in bytes.
    pub bytes: usize,
    /// Hex-encoded SHA-256 of the payload.
    pub sha256: String,
    /// Another write to the same key was in flight in this process.
    pub race_detected: bool,
    /// When the rename completed.
    pub written_at: DateTime<Utc>,
}

/// Durable key/value store for job progress.
pub struct CheckpointStore {
    dir: PathBuf,
    in_flight: Mutex<HashMap<CheckpointKey, usize>>,
    metrics: MetricsCollector,
}

/// Marks a key as being written until dropped.
struct InFlight<'a> {
    writers: &'a Mutex<HashMap<CheckpointKey, usize>>,
    key: CheckpointKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = writers.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                writers.remove(&self.key);
            }
        }
    }
}

impl CheckpointStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            in_flight: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path of a key.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::InvalidKey` if the encoded key is too long
    /// to be a file name.
    pub fn path_for(&self, key: &CheckpointKey) -> Result<PathBuf, CheckpointError> {
        let name = key.file_name();
        if name.len() > MAX_FILE_NAME_BYTES {
            return Err(CheckpointError::InvalidKey(format!(
                "encoded key is {} bytes, limit is {}",
                name.len(),
                MAX_FILE_NAME_BYTES
            )));
        }
        Ok(self.dir.join(name))
    }

    fn enter(&self, key: &CheckpointKey) -> (InFlight<'_>, bool) {
        let mut writers = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let count = writers.entry(key.clone()).or_insert(0);
        let raced = *count > 0;
        *count += 1;

        (
            InFlight {
                writers: &self.in_flight,
                key: key.clone(),
            },
            raced,
        )
    }

    /// Atomically replaces the checkpoint stored under `key`.
    pub async fn write(
        &self,
        key: &CheckpointKey,
        payload: &[u8],
    ) -> Result<WriteReceipt, CheckpointError> {
        let path = self.path_for(key)?;
        let (_in_flight, race_detected) = self.enter(key);

        if race_detected {
            warn!(
                key = %key,
                "Concurrent checkpoint write detected; last rename wins"
            );
        }

        atomic_write(&path, payload).await?;
        self.metrics.record_checkpoint_write(race_detected);

        debug!(key = %key, bytes = payload.len(), "Checkpoint written");

        Ok(WriteReceipt {
            key: key.clone(),
            bytes: payload.len(),
            sha256: hex::encode(Sha256::digest(payload)),
            race_detected,
            written_at: Utc::now(),
        })
    }

    /// Serializes `value` as JSON and writes it under `key`.
    pub async fn write_json<T: Serialize>(
        &self,
        key: &CheckpointKey,
        value: &T,
    ) -> Result<WriteReceipt, CheckpointError> {
        let payload = serde_json::to_vec(value)?;
        self.write(key, &payload).await
    }

    /// Reads the checkpoint stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::NotFound` when no checkpoint exists.
    pub async fn read(&self, key: &CheckpointKey) -> Result<Vec<u8>, CheckpointError> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CheckpointError::NotFound(key.to_string())
            } else {
                CheckpointError::Io(e)
            }
        })
    }

    /// Reads and deserializes a JSON checkpoint.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        key: &CheckpointKey,
    ) -> Result<T, CheckpointError> {
        let payload = self.read(key).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Returns whether a checkpoint exists under `key`.
    pub async fn exists(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Deletes the checkpoint stored under `key`.
    ///
    /// Idempotent: deleting a missing checkpoint succeeds and returns
    /// `false`. Only the exact key is touched.
    pub async fn delete(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                sync_dir(&self.dir).await?;
                debug!(key = %key, "Checkpoint deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }

    /// Lists the keys of all stored checkpoints, sorted.
    ///
    /// In-progress temporary files are not reported.
    pub async fn list(&self) -> Result<Vec<CheckpointKey>, CheckpointError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(CheckpointKey::from_file_name) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Removes temporary files left behind by writers that crashed before
    /// their rename.
    ///
    /// Only files last modified at least `older_than` ago are removed, so
    /// temp files of live writers in other processes are left alone.
    /// Returns the number of files removed.
    pub async fn sweep_temp_files(&self, older_than: Duration) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_temp_file(name) {
                continue;
            }

            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::MAX);
            if age < older_than {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::Io(e)),
            }
        }

        if removed > 0 {
            warn!(removed = removed, dir = ?self.dir, "Removed stale checkpoint temp files");
        }

        Ok(removed)
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

fn temp_path_for(path: &Path) -> std::io::Result<PathBuf> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;

    Ok(dir.join(format!(
        ".{}.{}{}",
        name,
        Uuid::new_v4().simple(),
        TEMP_SUFFIX
    )))
}

/// Flushes a directory so a completed rename survives a crash.
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir).await?;
        handle.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Writes `data` to `path` through a same-directory temp file and rename.
///
/// The temp file is removed again if any step fails.
pub(crate) async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = temp_path_for(path)?;

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, path).await?;

        if let Some(dir) = path.parent() {
            sync_dir(dir).await?;
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::key::ParameterKeyBuilder;
    use crate::job::JobIdentity;

    fn key(raw: &str) -> CheckpointKey {
        CheckpointKey::from_raw(raw)
    }

    async fn open_store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = CheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .expect("store should open");
        (dir, store)
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.expect("read dir");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");

        let receipt = store.write(&k, b"step=3").await.expect("write");
        assert_eq!(receipt.bytes, 6);
        assert_eq!(receipt.sha256.len(), 64);
        assert!(!receipt.race_detected);

        assert_eq!(store.read(&k).await.expect("read"), b"step=3");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_payload() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");

        store.write(&k, b"step=1").await.expect("write");
        store.write(&k, b"step=2").await.expect("write");

        assert_eq!(store.read(&k).await.expect("read"), b"step=2");
        assert_eq!(store.list().await.expect("list"), vec![k]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_dir, store) = open_store().await;
        let err = store
            .read(&key("ingest:1:2024"))
            .await
            .expect_err("missing checkpoint");
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");
        store.write(&k, b"done").await.expect("write");

        assert!(store.delete(&k).await.expect("first delete"));
        assert!(!store.delete(&k).await.expect("second delete"));
        assert!(!store.delete(&key("never:written")).await.expect("delete"));
        assert!(!store.exists(&k).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_deleting_one_key_keeps_the_other() {
        let (_dir, store) = open_store().await;
        let builder = ParameterKeyBuilder::new("ingest").differentiating(["threshold", "year"]);
        let low = builder
            .build_for(
                &JobIdentity::new("ingest")
                    .with_param("threshold", 250)
                    .with_param("year", 2024),
            )
            .expect("key");
        let high = builder
            .build_for(
                &JobIdentity::new("ingest")
                    .with_param("threshold", 500)
                    .with_param("year", 2024),
            )
            .expect("key");

        assert_eq!(low.as_str(), "ingest:250:2024");
        assert_eq!(high.as_str(), "ingest:500:2024");

        store.write(&low, b"low").await.expect("write");
        store.write(&high, b"high").await.expect("write");
        store.delete(&low).await.expect("delete");

        assert!(!store.exists(&low).await.expect("exists"));
        assert_eq!(store.read(&high).await.expect("read"), b"high");
    }

    #[tokio::test]
    async fn test_crash_before_rename_keeps_prior_value() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");
        store.write(&k, b"{\"step\":1}").await.expect("write");

        // A writer that died mid-write leaves only a partial temp file
        let final_path = store.path_for(&k).expect("path");
        let tmp = temp_path_for(&final_path).expect("temp path");
        fs::write(&tmp, b"{\"step\":2, \"par").await.expect("partial write");

        assert_eq!(store.read(&k).await.expect("read"), b"{\"step\":1}");
        assert_eq!(store.list().await.expect("list"), vec![k.clone()]);

        let removed = store
            .sweep_temp_files(Duration::ZERO)
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
        assert_eq!(file_names(store.dir()).await, vec![k.file_name()]);
    }

    #[tokio::test]
    async fn test_crash_on_first_write_leaves_nothing_readable() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");

        let tmp = temp_path_for(&store.path_for(&k).expect("path")).expect("temp path");
        fs::write(&tmp, b"partial").await.expect("partial write");

        assert!(matches!(
            store.read(&k).await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_temp_files() {
        let (_dir, store) = open_store().await;
        let tmp = temp_path_for(&store.path_for(&key("a")).expect("path")).expect("temp");
        fs::write(&tmp, b"in progress").await.expect("write");

        let removed = store
            .sweep_temp_files(Duration::from_secs(3600))
            .await
            .expect("sweep");
        assert_eq!(removed, 0);
        assert!(fs::try_exists(&tmp).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_successful_write_leaves_no_temp_files() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");
        store.write(&k, b"payload").await.expect("write");

        assert_eq!(file_names(store.dir()).await, vec![k.file_name()]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_different_keys() {
        let (_dir, store) = open_store().await;
        let keys: Vec<CheckpointKey> = (0..16).map(|i| key(&format!("ingest:{}:2024", i))).collect();

        let writes = keys
            .iter()
            .map(|k| store.write(k, k.as_str().as_bytes()));
        let receipts = futures::future::join_all(writes).await;

        for receipt in receipts {
            assert!(!receipt.expect("write").race_detected);
        }
        for k in &keys {
            assert_eq!(store.read(k).await.expect("read"), k.as_str().as_bytes());
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_key_writes_leave_one_whole_payload() {
        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");
        let a = vec![b'a'; 64 * 1024];
        let b = vec![b'b'; 64 * 1024];

        let (ra, rb) = tokio::join!(store.write(&k, &a), store.write(&k, &b));
        ra.expect("write a");
        rb.expect("write b");

        let stored = store.read(&k).await.expect("read");
        assert!(stored == a || stored == b);
    }

    #[test]
    fn test_overlapping_writers_are_flagged() {
        let store = CheckpointStore {
            dir: PathBuf::from("/unused"),
            in_flight: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        };
        let k = key("ingest:250:2024");

        let (first, first_raced) = store.enter(&k);
        let (second, second_raced) = store.enter(&k);
        assert!(!first_raced);
        assert!(second_raced);

        drop(first);
        drop(second);
        let (_third, third_raced) = store.enter(&k);
        assert!(!third_raced);
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Progress {
            step: u32,
            cursor: String,
        }

        let (_dir, store) = open_store().await;
        let k = key("ingest:250:2024");
        let progress = Progress {
            step: 7,
            cursor: "row-9000".to_string(),
        };

        store.write_json(&k, &progress).await.expect("write");
        let loaded: Progress = store.read_json(&k).await.expect("read");
        assert_eq!(loaded, progress);
    }

    #[tokio::test]
    async fn test_overlong_key_is_rejected() {
        let (_dir, store) = open_store().await;
        let k = key(&"x".repeat(400));
        assert!(matches!(
            store.write(&k, b"data").await,
            Err(CheckpointError::InvalidKey(_))
        ));
    }
}
