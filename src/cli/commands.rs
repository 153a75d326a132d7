//! CLI command definitions for jobwarden.
//!
//! Every command loads `CoordinatorConfig` from `--config` (YAML) or, when
//! absent, from `JOBWARDEN_*` environment variables.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::autoscale::{Autoscaler, GroupLimitStore, GroupTick, TickReport};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::graph::DependencyWatcher;
use crate::job::defaults::resolve;
use crate::job::{Job, JobIdentity};
use crate::metrics::{export_metrics, init_metrics};
use crate::probe::{LinuxHostProbe, ResourceProbe};
use crate::queue::{InMemoryJobQueue, JobQueueClient, RedisJobQueue};

/// Default age after which orphaned temp files are swept.
const DEFAULT_SWEEP_AGE_SECS: u64 = 3600;

/// Concurrent job safety coordinator.
#[derive(Parser)]
#[command(name = "jobwarden")]
#[command(about = "Checkpoint keys, atomic checkpoints, duplicate guards and autoscaling for parameterized jobs")]
#[command(version)]
#[command(
    long_about = "jobwarden keeps parameterized batch jobs from corrupting each other's checkpoints, \
refuses duplicate submissions, releases dependent jobs when their predecessors finish, and adapts \
per-group parallelism to host headroom.\n\nExample usage:\n  jobwarden --config jobwarden.yaml key --family ingest --param threshold=250 --param year=2024\n  jobwarden --config jobwarden.yaml autoscale"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file. Without it, configuration comes from the environment.
    #[arg(short, long, global = true, env = "JOBWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the checkpoint key of a job identity.
    Key(KeyArgs),

    /// Inspect and maintain the checkpoint store.
    #[command(alias = "ckpt")]
    Checkpoint(CheckpointArgs),

    /// Print the hard memory cap a job would be submitted with.
    Memcap(MemcapArgs),

    /// Sample host resources once.
    Probe(ProbeArgs),

    /// Run the autoscaler loop.
    Autoscale(AutoscaleArgs),

    /// Show current and persisted group limits.
    Limits(LimitsArgs),

    /// Print Prometheus metrics after initialization.
    Metrics,

    /// Submit a job file and release dependents as predecessors finish.
    Run(RunArgs),
}

/// Arguments for `jobwarden key`.
#[derive(Parser, Debug)]
pub struct KeyArgs {
    /// Job family.
    #[arg(short, long)]
    pub family: String,

    /// Parameter as NAME=VALUE. Repeatable.
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Output JSON instead of the bare key.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `jobwarden checkpoint`.
#[derive(Parser, Debug)]
pub struct CheckpointArgs {
    #[command(subcommand)]
    pub command: CheckpointSubcommand,
}

/// Checkpoint subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CheckpointSubcommand {
    /// Write a checkpoint's payload to stdout or a file.
    Get {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Atomically replace a checkpoint from a file or stdin.
    Put {
        key: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a checkpoint.
    Delete { key: String },

    /// List stored checkpoint keys.
    List {
        #[arg(short, long)]
        json: bool,
    },

    /// Remove temp files left behind by interrupted writes.
    Sweep {
        /// Only remove temp files older than this many seconds.
        #[arg(long, default_value_t = DEFAULT_SWEEP_AGE_SECS)]
        older_than_secs: u64,
    },
}

/// Arguments for `jobwarden memcap`.
#[derive(Parser, Debug)]
pub struct MemcapArgs {
    #[arg(short, long)]
    pub family: String,

    /// Resource group the job runs in.
    #[arg(short, long)]
    pub group: String,

    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Output format: docker, systemd or json.
    #[arg(long, default_value = "docker")]
    pub format: String,
}

/// Arguments for `jobwarden probe`.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `jobwarden autoscale`.
#[derive(Parser, Debug)]
pub struct AutoscaleArgs {
    /// Run a single tick and exit.
    #[arg(long)]
    pub once: bool,

    /// Use the in-memory queue; limits are computed but reach no daemon.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `jobwarden limits`.
#[derive(Parser, Debug)]
pub struct LimitsArgs {
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `jobwarden run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML file with a list of jobs (id, identity, group, depends_on).
    #[arg(short, long)]
    pub jobs: PathBuf,

    /// Use the in-memory queue.
    #[arg(long)]
    pub dry_run: bool,

    /// Do not start the autoscaler alongside the watcher.
    #[arg(long)]
    pub no_autoscale: bool,
}

/// Parse command line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Key(args) => run_key_command(&config, args),
        Commands::Checkpoint(args) => run_checkpoint_command(&config, args).await,
        Commands::Memcap(args) => run_memcap_command(&config, args),
        Commands::Probe(args) => run_probe_command(&config, args).await,
        Commands::Autoscale(args) => run_autoscale_command(config, args).await,
        Commands::Limits(args) => run_limits_command(&config, args).await,
        Commands::Metrics => run_metrics_command(),
        Commands::Run(args) => run_jobs_command(config, args).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => CoordinatorConfig::from_env().context("Failed to load configuration from environment"),
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    if name.trim().is_empty() {
        return Err(format!("parameter name missing in '{}'", raw));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

fn identity_from(family: &str, params: &[(String, String)]) -> JobIdentity {
    params
        .iter()
        .fold(JobIdentity::new(family), |identity, (name, value)| {
            identity.with_param(name.clone(), value)
        })
}

async fn connect_queue(config: &CoordinatorConfig, dry_run: bool) -> anyhow::Result<Arc<dyn JobQueueClient>> {
    if dry_run || config.dry_run {
        info!("Dry run: using in-memory queue");
        return Ok(Arc::new(InMemoryJobQueue::new()));
    }

    let url = config.require_redis_url()?;
    let queue = RedisJobQueue::connect(url, &config.queue_name)
        .await
        .context("Failed to connect to queue daemon")?;
    Ok(Arc::new(queue))
}

fn build_autoscaler(
    config: &CoordinatorConfig,
    queue: Arc<dyn JobQueueClient>,
) -> anyhow::Result<Autoscaler> {
    let host = LinuxHostProbe::new()
        .with_proc_root(&config.proc_root)
        .with_cgroup_root(config.cgroup_root.clone());
    let probe = ResourceProbe::new(Arc::new(host)).with_timeout(config.probe_timeout());

    let autoscaler = Autoscaler::new(config.groups.clone(), config.scaling_policy(), probe, queue)?;
    Ok(autoscaler.with_store(GroupLimitStore::new(&config.state_dir)))
}

/// Registers metrics for commands that keep running; failure only loses metrics.
fn init_command_metrics() {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics, continuing without them");
    }
}

/// Broadcasts shutdown on Ctrl-C.
fn shutdown_on_ctrl_c() -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            let _ = signal_tx.send(());
        }
    });
    shutdown_tx
}

// ============================================================================
// Key and memory cap
// ============================================================================

#[derive(Debug, Serialize)]
struct KeyOutput {
    label: String,
    key: String,
    file_name: String,
    overridden_defaults: Vec<String>,
}

fn run_key_command(config: &CoordinatorConfig, args: KeyArgs) -> anyhow::Result<()> {
    let identity = identity_from(&args.family, &args.params);
    let resolved = resolve(&config.environment(), &identity);
    let key = config.key_registry().key_for(&resolved.identity)?;

    if args.json {
        let output = KeyOutput {
            label: resolved.identity.label(),
            key: key.to_string(),
            file_name: key.file_name(),
            overridden_defaults: resolved
                .violations
                .iter()
                .map(|v| v.parameter.clone())
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", key);
    }
    Ok(())
}

fn run_memcap_command(config: &CoordinatorConfig, args: MemcapArgs) -> anyhow::Result<()> {
    let profile = config
        .profile(&args.group)
        .with_context(|| format!("Unknown resource group '{}'", args.group))?;
    let identity = identity_from(&args.family, &args.params);
    let resolved = resolve(&config.environment(), &identity);
    let cap = config.memory_policy().derive_limit(&resolved.identity, profile);

    match args.format.as_str() {
        "docker" => println!("{}", cap.docker_args().join(" ")),
        "systemd" => {
            for property in cap.systemd_properties() {
                println!("{}", property);
            }
        }
        "json" => println!("{}", serde_json::to_string_pretty(&cap)?),
        other => anyhow::bail!("Unknown format '{}': expected docker, systemd or json", other),
    }
    Ok(())
}

// ============================================================================
// Checkpoint store
// ============================================================================

async fn run_checkpoint_command(config: &CoordinatorConfig, args: CheckpointArgs) -> anyhow::Result<()> {
    let store = CheckpointStore::open(&config.checkpoint_dir)
        .await
        .with_context(|| format!("Failed to open checkpoint store {}", config.checkpoint_dir.display()))?;

    match args.command {
        CheckpointSubcommand::Get { key, output } => {
            let payload = store.read(&CheckpointKey::from_raw(key)).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &payload).await?,
                None => std::io::stdout().write_all(&payload)?,
            }
        }
        CheckpointSubcommand::Put { key, file } => {
            let payload = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buffer = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buffer).await?;
                    buffer
                }
            };
            let receipt = store.write(&CheckpointKey::from_raw(key), &payload).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        CheckpointSubcommand::Delete { key } => {
            let key = CheckpointKey::from_raw(key);
            if store.delete(&key).await? {
                println!("Deleted {}", key);
            } else {
                warn!(key = %key, "No checkpoint to delete");
            }
        }
        CheckpointSubcommand::List { json } => {
            let keys = store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                for key in keys {
                    println!("{}", key);
                }
            }
        }
        CheckpointSubcommand::Sweep { older_than_secs } => {
            let removed = store
                .sweep_temp_files(Duration::from_secs(older_than_secs))
                .await?;
            println!("Removed {} orphaned temp file(s)", removed);
        }
    }
    Ok(())
}

// ============================================================================
// Probe, autoscaler and limits
// ============================================================================

async fn run_probe_command(config: &CoordinatorConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let host = LinuxHostProbe::new()
        .with_proc_root(&config.proc_root)
        .with_cgroup_root(config.cgroup_root.clone());
    let probe = ResourceProbe::new(Arc::new(host)).with_timeout(config.probe_timeout());
    let groups: Vec<String> = config.groups.iter().map(|g| g.name.clone()).collect();

    let sample = probe.sample(&groups).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sample)?);
    } else {
        println!("cpu load:         {:.2}", sample.cpu_load_fraction);
        println!(
            "memory available: {:.2} ({} of {} MiB)",
            sample.memory_available_fraction,
            sample.memory_available_bytes / (1024 * 1024),
            sample.memory_total_bytes / (1024 * 1024)
        );
        for (group, bytes) in &sample.per_group_footprint {
            println!("group {:<12} {} MiB", group, bytes / (1024 * 1024));
        }
    }
    Ok(())
}

fn describe_outcome(outcome: &GroupTick) -> String {
    match outcome {
        GroupTick::CoolingDown { remaining } => format!("cooling down ({}s left)", remaining.as_secs()),
        GroupTick::Unchanged => "unchanged".to_string(),
        GroupTick::Scaled(decision) => format!(
            "scaled {} {} -> {} ({})",
            decision.direction(),
            decision.old_limit,
            decision.new_limit,
            decision.trigger
        ),
        GroupTick::Vetoed {
            candidate,
            required_bytes,
            budget_bytes,
        } => format!(
            "scale-up to {} vetoed (needs {} MiB, budget {} MiB)",
            candidate,
            required_bytes / (1024 * 1024),
            budget_bytes / (1024 * 1024)
        ),
        GroupTick::ProbeUnavailable => "probe unavailable".to_string(),
        GroupTick::QueueRejected(reason) => format!("queue rejected: {}", reason),
    }
}

fn print_tick(report: &TickReport) {
    for (group, outcome) in &report.outcomes {
        println!("{:<16} {}", group, describe_outcome(outcome));
    }
}

async fn run_autoscale_command(config: CoordinatorConfig, args: AutoscaleArgs) -> anyhow::Result<()> {
    if config.groups.is_empty() {
        anyhow::bail!("No resource groups configured");
    }

    init_command_metrics();
    let queue = connect_queue(&config, args.dry_run).await?;
    let mut autoscaler = build_autoscaler(&config, queue)?;
    autoscaler.initialize().await;

    if args.once {
        let report = autoscaler.tick().await;
        print_tick(&report);
        return Ok(());
    }

    let shutdown_tx = shutdown_on_ctrl_c();
    autoscaler.run(shutdown_tx.subscribe()).await;
    Ok(())
}

#[derive(Debug, Serialize)]
struct LimitRow {
    min: usize,
    max: usize,
    initial: usize,
    persisted: Option<usize>,
}

async fn run_limits_command(config: &CoordinatorConfig, args: LimitsArgs) -> anyhow::Result<()> {
    let store = GroupLimitStore::new(&config.state_dir);
    let persisted = store.load().await?;

    let rows: BTreeMap<String, LimitRow> = config
        .groups
        .iter()
        .map(|profile| {
            (
                profile.name.clone(),
                LimitRow {
                    min: profile.min_parallelism,
                    max: profile.max_parallelism,
                    initial: profile.initial(),
                    persisted: persisted.get(&profile.name).copied(),
                },
            )
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<16} {:>5} {:>5} {:>8} {:>10}", "GROUP", "MIN", "MAX", "INITIAL", "CURRENT");
    for (group, row) in &rows {
        let current = row
            .persisted
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:>5} {:>5} {:>8} {:>10}",
            group, row.min, row.max, row.initial, current
        );
    }
    for group in persisted.keys().filter(|g| config.profile(g).is_none()) {
        warn!(group = %group, "Persisted limit for a group that is no longer configured");
    }
    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    print!("{}", export_metrics());
    Ok(())
}

// ============================================================================
// Dependency-driven submission
// ============================================================================

async fn run_jobs_command(config: CoordinatorConfig, args: RunArgs) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&args.jobs)
        .await
        .with_context(|| format!("Failed to read {}", args.jobs.display()))?;
    let jobs: Vec<Job> = serde_yaml::from_str(&content).context("Failed to parse job file")?;

    init_command_metrics();
    let queue = connect_queue(&config, args.dry_run).await?;
    let shutdown_tx = shutdown_on_ctrl_c();

    let mut coordinator = Coordinator::from_config(&config, queue.clone()).await?;

    let autoscaler_handle = if args.no_autoscale || config.groups.is_empty() {
        None
    } else {
        let mut autoscaler = build_autoscaler(&config, queue)?;
        autoscaler.initialize().await;
        coordinator = coordinator.with_limits(autoscaler.limits());
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { autoscaler.run(shutdown_rx).await }))
    };

    let mut watcher = DependencyWatcher::new(jobs, Arc::new(coordinator))?
        .with_poll_interval(config.watch_interval());
    let result = watcher.run(shutdown_tx.subscribe()).await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = autoscaler_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Autoscaler task ended abnormally");
        }
    }

    result?;
    let graph = watcher.graph();
    info!(
        jobs = graph.len(),
        blocked = graph.blocked().len(),
        complete = graph.is_complete(),
        "Run finished"
    );
    Ok(())
}
