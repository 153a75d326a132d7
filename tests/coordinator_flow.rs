//! End-to-end flows through the public API.
//!
//! Everything runs against the in-memory queue and a fixed host probe, so
//! no daemon or real host statistics are needed.

use std::sync::Arc;
use std::time::Duration;

use jobwarden::autoscale::{
    Autoscaler, GroupLimitStore, GroupResourceProfile, GroupTick, ScalingPolicy, ScalingState,
};
use jobwarden::checkpoint::{build_key, CheckpointKey, CheckpointStore, KeyRegistry, ParameterKeyBuilder};
use jobwarden::config::{CoordinatorConfig, FamilyConfig};
use jobwarden::graph::DependencyWatcher;
use jobwarden::job::{Job, JobId, JobIdentity, JobStatus};
use jobwarden::probe::{FixedHostProbe, ResourceProbe};
use jobwarden::queue::{InMemoryJobQueue, JobQueueClient, QueueStatus};
use jobwarden::{Coordinator, JobRequest, SubmitOutcome};
use tokio::time::Instant;

fn ingest(threshold: u32, year: u32) -> JobIdentity {
    JobIdentity::new("ingest")
        .with_param("threshold", threshold)
        .with_param("year", year)
}

fn batch(min: usize, max: usize, initial: usize, per_job_mb: u64) -> GroupResourceProfile {
    GroupResourceProfile::new("batch", min, max, per_job_mb)
        .and_then(|p| p.with_initial(initial))
        .expect("valid profile")
}

#[tokio::test]
async fn test_distinct_thresholds_get_distinct_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open(dir.path()).await.expect("store");
    let registry =
        KeyRegistry::new().with(ParameterKeyBuilder::new("ingest").differentiating(["threshold", "year"]));

    let low = registry.key_for(&ingest(250, 2024)).expect("key");
    let high = registry.key_for(&ingest(500, 2024)).expect("key");
    assert_eq!(low.as_str(), "ingest:250:2024");
    assert_eq!(high.as_str(), "ingest:500:2024");

    store.write(&low, b"rows=1000").await.expect("write");
    store.write(&high, b"rows=2000").await.expect("write");

    assert!(store.delete(&low).await.expect("delete"));
    assert!(!store.delete(&low).await.expect("second delete"));
    assert_eq!(store.read(&high).await.expect("read"), b"rows=2000");
    assert_eq!(store.list().await.expect("list"), vec![high]);
}

#[test]
fn test_key_tuples_never_collide() {
    let tuples: [&[(&str, &str)]; 5] = [
        &[("a", "1:2"), ("b", "3")],
        &[("a", "1"), ("b", "2:3")],
        &[("a", "1%3A2"), ("b", "3")],
        &[("a", ""), ("b", "1:2:3")],
        &[("a", "1:2:3"), ("b", "")],
    ];
    let keys: Vec<CheckpointKey> = tuples
        .iter()
        .map(|params| build_key("ingest", params).expect("key"))
        .collect();

    for (i, a) in keys.iter().enumerate() {
        for b in keys.iter().skip(i + 1) {
            assert_ne!(a, b);
        }
    }
}

#[tokio::test]
async fn test_autoscaler_scale_up_and_cooldown() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let host = Arc::new(FixedHostProbe::with_fractions(0.3, 0.6));
    let mut autoscaler = Autoscaler::new(
        [batch(2, 8, 2, 512)],
        ScalingPolicy::default(),
        ResourceProbe::new(host.clone()),
        queue.clone(),
    )
    .expect("unique groups");

    let t0 = Instant::now();
    let report = autoscaler.tick_at(t0).await;
    assert_eq!(report.decisions().len(), 1);
    assert_eq!(autoscaler.current_limit("batch"), Some(4));
    assert_eq!(queue.parallelism("batch").await, Some(4));
    assert!(matches!(
        autoscaler.state("batch"),
        Some(ScalingState::Cooldown { .. })
    ));

    // Inside the five-minute cooldown the probe is not consulted at all
    host.set(jobwarden::probe::HostSnapshot::with_fractions(0.95, 0.05));
    let report = autoscaler.tick_at(t0 + Duration::from_secs(299)).await;
    assert!(!report.probed);
    assert_eq!(autoscaler.current_limit("batch"), Some(4));
    assert_eq!(host.sample_count(), 1);
}

#[tokio::test]
async fn test_autoscaler_respects_bounds_and_memory_budget() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let host = Arc::new(FixedHostProbe::with_fractions(0.1, 0.9));
    let policy = ScalingPolicy::default().with_cooldown(Duration::ZERO);
    let mut autoscaler = Autoscaler::new(
        [batch(1, 5, 1, 64)],
        policy,
        ResourceProbe::new(host.clone()),
        queue.clone(),
    )
    .expect("unique groups");

    let mut now = Instant::now();
    for _ in 0..10 {
        autoscaler.tick_at(now).await;
        let limit = autoscaler.current_limit("batch").expect("limit");
        assert!((1..=5).contains(&limit));
        now += Duration::from_secs(1);
    }
    assert_eq!(autoscaler.current_limit("batch"), Some(5));

    // 16 GiB host with 10% free: 8 jobs of 2 GiB do not fit in 80% of 1.6 GiB
    let queue = Arc::new(InMemoryJobQueue::new());
    let host = Arc::new(FixedHostProbe::with_fractions(0.1, 0.1));
    let policy = ScalingPolicy {
        scale_up_memory_above: 0.05,
        scale_down_memory_below: 0.0,
        ..ScalingPolicy::default()
    };
    let mut autoscaler = Autoscaler::new(
        [batch(1, 8, 1, 2048)],
        policy,
        ResourceProbe::new(host),
        queue.clone(),
    )
    .expect("unique groups");
    let report = autoscaler.tick_at(Instant::now()).await;
    assert!(matches!(report.outcome("batch"), Some(GroupTick::Vetoed { .. })));
    assert_eq!(autoscaler.current_limit("batch"), Some(1));
    assert_eq!(queue.parallelism("batch").await, None);
}

#[tokio::test]
async fn test_autoscaler_restores_persisted_limits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = GroupLimitStore::new(dir.path());
    let queue = Arc::new(InMemoryJobQueue::new());

    let mut first = Autoscaler::new(
        [batch(2, 8, 2, 512)],
        ScalingPolicy::default(),
        ResourceProbe::new(Arc::new(FixedHostProbe::with_fractions(0.3, 0.6))),
        queue.clone(),
    )
    .expect("unique groups")
    .with_store(store.clone());
    first.tick_at(Instant::now()).await;
    assert_eq!(first.current_limit("batch"), Some(4));

    let mut second = Autoscaler::new(
        [batch(2, 8, 2, 512)],
        ScalingPolicy::default(),
        ResourceProbe::new(Arc::new(FixedHostProbe::with_fractions(0.6, 0.5))),
        queue.clone(),
    )
    .expect("unique groups")
    .with_store(store);
    second.initialize().await;
    assert_eq!(second.current_limit("batch"), Some(4));
    assert_eq!(queue.parallelism("batch").await, Some(4));
}

#[tokio::test]
async fn test_fan_in_with_failed_predecessor_never_submits_successor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = CoordinatorConfig::default()
        .with_checkpoint_dir(dir.path().join("checkpoints"))
        .with_group(batch(1, 4, 2, 256))
        .with_family(FamilyConfig::new("ingest").with_differentiating(["threshold", "year"]))
        .with_family(FamilyConfig::new("merge"));
    let queue = Arc::new(InMemoryJobQueue::new());
    let coordinator = Arc::new(
        Coordinator::from_config(&config, queue.clone())
            .await
            .expect("coordinator"),
    );

    let jobs = vec![
        Job::new("A", ingest(250, 2024), "batch"),
        Job::new("B", ingest(500, 2024), "batch"),
        Job::new("C", JobIdentity::new("merge"), "batch")
            .depends_on("A")
            .depends_on("B"),
    ];
    let mut watcher = DependencyWatcher::new(jobs, coordinator).expect("graph");

    watcher.tick().await.expect("tick");
    assert_eq!(queue.submitted().await.len(), 2);

    queue
        .set_status_for(&JobId::new("A"), QueueStatus::Succeeded)
        .await
        .expect("status");
    watcher.tick().await.expect("tick");
    assert_eq!(watcher.status(&JobId::new("C")), Some(JobStatus::Blocked));

    queue
        .set_status_for(&JobId::new("B"), QueueStatus::Failed)
        .await
        .expect("status");
    let report = watcher.tick().await.expect("tick");
    assert_eq!(report.blocked, vec![JobId::new("C")]);

    for _ in 0..3 {
        watcher.tick().await.expect("tick");
    }
    assert!(watcher.is_complete());
    assert_eq!(watcher.status(&JobId::new("C")), Some(JobStatus::Blocked));
    let submitted: Vec<String> = queue
        .submitted()
        .await
        .iter()
        .map(|spec| spec.job_id.to_string())
        .collect();
    assert_eq!(submitted, vec!["A", "B"]);
}

#[tokio::test]
async fn test_duplicate_identity_refused_while_live() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(CheckpointStore::open(dir.path()).await.expect("store"));
    let queue = Arc::new(InMemoryJobQueue::new());

    // Another coordinator already submitted the job directly to the daemon
    let other = Coordinator::new([batch(1, 4, 1, 256)], queue.clone(), store.clone());
    let outcome = other
        .submit(JobRequest::new("first", ingest(250, 2024), "batch"))
        .await
        .expect("submit");
    assert!(outcome.is_submitted());
    queue
        .set_status_for(&JobId::new("first"), QueueStatus::Running)
        .await
        .expect("status");
    assert_eq!(queue.list_running().await.expect("list").len(), 1);

    let coordinator = Coordinator::new([batch(1, 4, 1, 256)], queue.clone(), store);
    let outcome = coordinator
        .submit(JobRequest::new("second", ingest(250, 2024), "batch"))
        .await
        .expect("submit");
    assert_eq!(outcome, SubmitOutcome::AlreadyRunning);

    let outcome = coordinator
        .submit(JobRequest::new("third", ingest(500, 2024), "batch"))
        .await
        .expect("submit");
    assert!(outcome.is_submitted());
}

#[tokio::test]
async fn test_submitted_spec_carries_swapless_memory_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(CheckpointStore::open(dir.path()).await.expect("store"));
    let queue = Arc::new(InMemoryJobQueue::new());
    let coordinator = Coordinator::new([batch(1, 4, 1, 700)], queue.clone(), store);

    coordinator
        .submit(JobRequest::new("a", ingest(250, 2024), "batch"))
        .await
        .expect("submit");

    let spec = queue.submitted().await.pop().expect("one spec");
    assert_eq!(spec.memory_cap.hard_limit_mib(), 700);
    assert!(spec.memory_cap.swap_disabled());
    assert!(spec
        .memory_cap
        .docker_args()
        .contains(&"--memory-swap=700m".to_string()));
}

#[tokio::test]
async fn test_families_without_schema_keep_jobs_apart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = CoordinatorConfig::default()
        .with_checkpoint_dir(dir.path().join("checkpoints"))
        .with_group(batch(1, 4, 2, 256))
        .with_family(FamilyConfig::new("report").with_default("toolchain", "1.0"));
    let queue = Arc::new(InMemoryJobQueue::new());
    let coordinator = Coordinator::from_config(&config, queue.clone())
        .await
        .expect("coordinator");

    let identities = [
        JobIdentity::new("report").with_param("day", 1),
        JobIdentity::new("report").with_param("day", 2),
        JobIdentity::new("export").with_param("day", 1).with_param("region", "eu"),
        JobIdentity::new("export").with_param("day", 1).with_param("shard", "eu"),
    ];
    for (i, identity) in identities.iter().enumerate() {
        let outcome = coordinator
            .submit(JobRequest::new(format!("job-{}", i), identity.clone(), "batch"))
            .await
            .expect("submit");
        assert!(outcome.is_submitted());
    }

    let keys: std::collections::HashSet<CheckpointKey> = queue
        .submitted()
        .await
        .into_iter()
        .map(|spec| spec.checkpoint_key)
        .collect();
    assert_eq!(keys.len(), identities.len());
}
