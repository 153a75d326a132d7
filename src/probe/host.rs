//! Host statistics sources.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProbeError;

const KIB: u64 = 1024;

/// Point-in-time host statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    /// One-minute load average.
    pub load_average: f64,
    /// Online CPUs.
    pub cpu_count: usize,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
}

impl HostSnapshot {
    /// Snapshot of a 16 GiB, 8-CPU host at the given load and memory
    /// fractions.
    pub fn with_fractions(cpu_load: f64, memory_available: f64) -> Self {
        let total = 16 * 1024 * 1024 * 1024u64;
        Self {
            load_average: cpu_load * 8.0,
            cpu_count: 8,
            memory_total_bytes: total,
            memory_available_bytes: (total as f64 * memory_available) as u64,
        }
    }

    /// Load average per CPU, clamped to `[0.0, 1.0]`.
    pub fn cpu_load_fraction(&self) -> f64 {
        if self.cpu_count == 0 {
            return 1.0;
        }
        (self.load_average / self.cpu_count as f64).clamp(0.0, 1.0)
    }

    /// Available memory as a fraction of total memory.
    pub fn memory_available_fraction(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_available_bytes as f64 / self.memory_total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of host statistics.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Samples host-wide load and memory.
    async fn sample(&self) -> Result<HostSnapshot, ProbeError>;

    /// Memory currently charged to a group, in bytes, if the host tracks it.
    async fn group_footprint(&self, _group: &str) -> Result<Option<u64>, ProbeError> {
        Ok(None)
    }
}

/// Reads `/proc` and cgroup v2 accounting files.
///
/// Group footprints come from `memory.current` of the group's slice,
/// `<cgroup_root>/jobwarden-<group>.slice/memory.current` by default.
#[derive(Debug, Clone)]
pub struct LinuxHostProbe {
    proc_root: PathBuf,
    cgroup_root: Option<PathBuf>,
    slice_prefix: String,
}

impl Default for LinuxHostProbe {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup")),
            slice_prefix: "jobwarden-".to_string(),
        }
    }
}

impl LinuxHostProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Sets the cgroup v2 mount point; `None` disables footprints.
    pub fn with_cgroup_root(mut self, root: Option<PathBuf>) -> Self {
        self.cgroup_root = root;
        self
    }

    pub fn with_slice_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.slice_prefix = prefix.into();
        self
    }

    fn cpu_count() -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
    }
}

#[async_trait]
impl HostProbe for LinuxHostProbe {
    async fn sample(&self) -> Result<HostSnapshot, ProbeError> {
        let loadavg = tokio::fs::read_to_string(self.proc_root.join("loadavg")).await?;
        let meminfo = tokio::fs::read_to_string(self.proc_root.join("meminfo")).await?;

        let load_average = parse_loadavg(&loadavg)?;
        let (memory_total_bytes, memory_available_bytes) = parse_meminfo(&meminfo)?;

        Ok(HostSnapshot {
            load_average,
            cpu_count: Self::cpu_count(),
            memory_total_bytes,
            memory_available_bytes,
        })
    }

    async fn group_footprint(&self, group: &str) -> Result<Option<u64>, ProbeError> {
        let Some(root) = &self.cgroup_root else {
            return Ok(None);
        };

        let path = root
            .join(format!("{}{}.slice", self.slice_prefix, group))
            .join("memory.current");

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ProbeError::Parse(format!("{}: '{}'", path.display(), content.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProbeError::Io(e)),
        }
    }
}

/// Parses the one-minute load average from `/proc/loadavg`.
pub(crate) fn parse_loadavg(content: &str) -> Result<f64, ProbeError> {
    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::Parse(format!("loadavg: '{}'", content.trim())))
}

/// Parses `(total, available)` bytes from `/proc/meminfo`.
///
/// Kernels without `MemAvailable` fall back to `MemFree + Buffers + Cached`.
pub(crate) fn parse_meminfo(content: &str) -> Result<(u64, u64), ProbeError> {
    let mut total = None;
    let mut available = None;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kib.saturating_mul(KIB);

        match name {
            "MemTotal:" => total = Some(bytes),
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" => free = bytes,
            "Buffers:" => buffers = bytes,
            "Cached:" => cached = bytes,
            _ => {}
        }
    }

    let total = total.ok_or_else(|| ProbeError::Parse("meminfo: missing MemTotal".to_string()))?;
    let available = available.unwrap_or(free + buffers + cached);
    Ok((total, available.min(total)))
}

/// Host probe returning scripted values.
///
/// Used for dry runs and tests; counts how often it is sampled.
#[derive(Debug)]
pub struct FixedHostProbe {
    snapshot: Mutex<Option<HostSnapshot>>,
    footprints: Mutex<HashMap<String, u64>>,
    delay: Mutex<Option<Duration>>,
    samples: AtomicUsize,
}

impl FixedHostProbe {
    pub fn new(snapshot: HostSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            footprints: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            samples: AtomicUsize::new(0),
        }
    }

    /// See [`HostSnapshot::with_fractions`].
    pub fn with_fractions(cpu_load: f64, memory_available: f64) -> Self {
        Self::new(HostSnapshot::with_fractions(cpu_load, memory_available))
    }

    pub fn set(&self, snapshot: HostSnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    /// Makes every sample fail with `ProbeError::Unavailable`.
    pub fn set_unavailable(&self) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Delays every sample, to exercise probe timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn set_footprint(&self, group: impl Into<String>, bytes: u64) {
        self.footprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group.into(), bytes);
    }

    /// Number of `sample` calls so far.
    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostProbe for FixedHostProbe {
    async fn sample(&self) -> Result<HostSnapshot, ProbeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ProbeError::Unavailable("no scripted snapshot".to_string()))
    }

    async fn group_footprint(&self, group: &str) -> Result<Option<u64>, ProbeError> {
        Ok(self
            .footprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1234567 kB\nMemAvailable:    8000000 kB\nBuffers:          123456 kB\nCached:          2345678 kB\n";
        let (total, available) = parse_meminfo(sample).expect("parse");
        assert_eq!(total, 16384000 * 1024);
        assert_eq!(available, 8000000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nBuffers:          500000 kB\nCached:          2000000 kB\n";
        let (_, available) = parse_meminfo(sample).expect("parse");
        assert_eq!(available, (1000000 + 500000 + 2000000) * 1024);
    }

    #[test]
    fn test_parse_meminfo_requires_total() {
        assert!(matches!(
            parse_meminfo("MemFree: 10 kB\n"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_loadavg() {
        let load = parse_loadavg("1.52 0.98 0.61 2/812 41234\n").expect("parse");
        assert!((load - 1.52).abs() < f64::EPSILON);
        assert!(parse_loadavg("").is_err());
    }

    #[test]
    fn test_snapshot_fractions() {
        let snapshot = HostSnapshot {
            load_average: 2.0,
            cpu_count: 8,
            memory_total_bytes: 1000,
            memory_available_bytes: 600,
        };
        assert!((snapshot.cpu_load_fraction() - 0.25).abs() < 1e-9);
        assert!((snapshot.memory_available_fraction() - 0.6).abs() < 1e-9);

        let overloaded = HostSnapshot {
            load_average: 32.0,
            ..snapshot
        };
        assert!((overloaded.cpu_load_fraction() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_linux_probe_reads_fake_proc() {
        let dir = tempfile::tempdir().expect("temp dir");
        let proc_root = dir.path().join("proc");
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(&proc_root).expect("mkdir");
        std::fs::create_dir_all(cgroup_root.join("jobwarden-batch.slice")).expect("mkdir");

        std::fs::write(proc_root.join("loadavg"), "0.50 0.40 0.30 1/100 999\n").expect("write");
        std::fs::write(
            proc_root.join("meminfo"),
            "MemTotal: 2048 kB\nMemAvailable: 1024 kB\n",
        )
        .expect("write");
        std::fs::write(
            cgroup_root.join("jobwarden-batch.slice").join("memory.current"),
            "4096\n",
        )
        .expect("write");

        let probe = LinuxHostProbe::new()
            .with_proc_root(&proc_root)
            .with_cgroup_root(Some(cgroup_root));

        let snapshot = probe.sample().await.expect("sample");
        assert_eq!(snapshot.memory_total_bytes, 2048 * 1024);
        assert_eq!(snapshot.memory_available_bytes, 1024 * 1024);
        assert!((snapshot.load_average - 0.5).abs() < f64::EPSILON);

        assert_eq!(probe.group_footprint("batch").await.expect("footprint"), Some(4096));
        assert_eq!(probe.group_footprint("other").await.expect("footprint"), None);
    }

    #[tokio::test]
    async fn test_linux_probe_missing_proc_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let probe = LinuxHostProbe::new().with_proc_root(dir.path());
        assert!(matches!(probe.sample().await, Err(ProbeError::Io(_))));
    }

    #[tokio::test]
    async fn test_fixed_probe_counts_samples() {
        let probe = FixedHostProbe::with_fractions(0.3, 0.5);
        probe.sample().await.expect("sample");
        probe.set_unavailable();
        assert!(probe.sample().await.is_err());
        assert_eq!(probe.sample_count(), 2);
    }
}
