//! Redis-backed job queue client.
//!
//! The coordinator and the daemon share three keys per queue name:
//!
//! - `{queue_name}:pending`: list of queue job ids waiting for a slot
//!   (LPUSH here, popped by the daemon)
//! - `{queue_name}:jobs`: hash of queue job id to JSON `JobRecord`
//!   (spec plus status, the daemon updates the status field)
//! - `{queue_name}:parallelism`: hash of group name to current limit

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobQueueClient, JobSpec, QueueError, QueueJobId, QueueStatus};
use crate::job::JobIdentity;

/// Redis key names derived from a queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub pending: String,
    pub jobs: String,
    pub parallelism: String,
}

impl QueueKeys {
    pub fn new(queue_name: &str) -> Self {
        Self {
            pending: format!("{}:pending", queue_name),
            jobs: format!("{}:jobs", queue_name),
            parallelism: format!("{}:parallelism", queue_name),
        }
    }
}

/// One entry of the `{queue_name}:jobs` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub status: QueueStatus,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn queued(spec: &JobSpec) -> Self {
        Self {
            spec: spec.clone(),
            status: QueueStatus::Queued,
            updated_at: Utc::now(),
        }
    }
}

/// Job queue client talking to the daemon through Redis.
pub struct RedisJobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    keys: QueueKeys,
}

impl RedisJobQueue {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Prefix of the Redis keys shared with the daemon
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a client from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            keys: QueueKeys::new(queue_name),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Reads the full record of a job.
    pub async fn record(&self, id: &QueueJobId) -> Result<JobRecord, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(&self.keys.jobs, id.as_str()).await?;

        match data {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Err(QueueError::JobNotFound(id.to_string())),
        }
    }

    /// Overwrites the status of a job, as the daemon does.
    pub async fn update_status(&self, id: &QueueJobId, status: QueueStatus) -> Result<(), QueueError> {
        let mut record = self.record(id).await?;
        record.status = status;
        record.updated_at = Utc::now();

        let serialized = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(&self.keys.jobs, id.as_str(), serialized)
            .await?;
        Ok(())
    }

    /// Current limit of a group as stored in Redis.
    pub async fn parallelism(&self, group: &str) -> Result<Option<usize>, QueueError> {
        let mut conn = self.redis.clone();
        let limit: Option<usize> = conn.hget(&self.keys.parallelism, group).await?;
        Ok(limit)
    }

    /// Number of jobs waiting for a slot.
    pub async fn pending_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.keys.pending).await?;
        Ok(len)
    }

    /// Deletes every key of this queue.
    ///
    /// **Warning**: This permanently deletes all job records.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.keys.pending)
            .del(&self.keys.jobs)
            .del(&self.keys.parallelism);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl JobQueueClient for RedisJobQueue {
    async fn submit(&self, spec: &JobSpec) -> Result<QueueJobId, QueueError> {
        let id = QueueJobId::new(Uuid::new_v4().to_string());
        let serialized = serde_json::to_string(&JobRecord::queued(spec))?;

        let mut conn = self.redis.clone();

        // Record and pending entry land together or not at all
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.keys.jobs, id.as_str(), &serialized)
            .lpush(&self.keys.pending, id.as_str());
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(queue = %self.queue_name, queue_job_id = %id, label = %spec.label, "Job enqueued");
        Ok(id)
    }

    async fn list_running(&self) -> Result<Vec<JobIdentity>, QueueError> {
        let mut conn = self.redis.clone();
        let records: Vec<String> = conn.hvals(&self.keys.jobs).await?;

        let mut live = Vec::new();
        for data in records {
            match serde_json::from_str::<JobRecord>(&data) {
                Ok(record) if record.status.is_live() => live.push(record.spec.identity),
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %self.queue_name, error = %e, "Skipping unparsable job record");
                }
            }
        }

        Ok(live)
    }

    async fn set_parallelism(&self, group: &str, limit: usize) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(&self.keys.parallelism, group, limit)
            .await?;
        Ok(())
    }

    async fn status(&self, id: &QueueJobId) -> Result<QueueStatus, QueueError> {
        Ok(self.record(id).await?.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointKey;
    use crate::job::JobId;
    use crate::limits::MemoryCap;

    fn create_test_spec(year: u32) -> JobSpec {
        let identity = JobIdentity::new("ingest").with_param("year", year);
        JobSpec {
            job_id: JobId::new(format!("ingest-{}", year)),
            label: identity.label(),
            identity,
            group: "batch".to_string(),
            checkpoint_key: CheckpointKey::from_raw(format!("ingest:{}", year)),
            memory_cap: MemoryCap::from_mib(1024),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("jobwarden");
        assert_eq!(keys.pending, "jobwarden:pending");
        assert_eq!(keys.jobs, "jobwarden:jobs");
        assert_eq!(keys.parallelism, "jobwarden:parallelism");
    }

    #[test]
    fn test_job_record_structure() {
        let record = JobRecord::queued(&create_test_spec(2024));
        let value = serde_json::to_value(&record).expect("record should serialize");

        assert_eq!(value["status"], "queued");
        assert_eq!(value["spec"]["checkpoint_key"], "ingest:2024");
        assert_eq!(value["spec"]["memory_cap"]["swap_disabled"], true);
        assert!(value.get("updated_at").is_some());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (set REDIS_URL)"]
    async fn test_live_redis_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let queue_name = format!("jobwarden-test-{}", Uuid::new_v4().simple());
        let queue = RedisJobQueue::connect(&url, &queue_name)
            .await
            .expect("connect");

        let spec = create_test_spec(2024);
        let id = queue.submit(&spec).await.expect("submit");
        assert_eq!(queue.pending_len().await.expect("len"), 1);
        assert_eq!(queue.status(&id).await.expect("status"), QueueStatus::Queued);
        assert_eq!(queue.list_running().await.expect("list"), vec![spec.identity.clone()]);

        queue
            .update_status(&id, QueueStatus::Succeeded)
            .await
            .expect("update");
        assert!(queue.list_running().await.expect("list").is_empty());

        queue.set_parallelism("batch", 3).await.expect("set");
        assert_eq!(queue.parallelism("batch").await.expect("get"), Some(3));

        queue.clear().await.expect("clear");
    }
}
