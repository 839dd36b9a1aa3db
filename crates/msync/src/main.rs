#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;

use msync_cluster::sieve::HashRingSieve;
use msync_cluster::ClusterDirectory;
use msync_core::types::TimeWindow;
use msync_pipeline::merge::CommandMerger;
use msync_pipeline::pipeline::{available_cpus, SyncCaps, SyncJob, Syncer, MAX_PARALLEL_FETCH};
use msync_pipeline::progress::ProgressObserver;
use msync_transport::{default_rsync_options, default_ssh_options, SshTransport};

#[derive(Debug, Parser)]
#[command(
    name = "msync",
    about = "Backfill gaps in local time-series storage from cluster peers"
)]
struct Args {
    /// Cluster to sync, as named in the cluster directory file.
    #[arg(long, env = "MSYNC_CLUSTER", default_value = "main")]
    cluster: String,

    /// Cluster to fetch from, when different from --cluster.
    #[arg(long, env = "MSYNC_REMOTE_CLUSTER")]
    remote_cluster: Option<String>,

    /// Cluster directory file.
    #[arg(long, env = "MSYNC_CONFIG", default_value = "/etc/msync/clusters.toml")]
    config: PathBuf,

    /// This node's name in the cluster's node list. Defaults to the
    /// machine hostname.
    #[arg(long, env = "MSYNC_NODE")]
    node: Option<String>,

    /// Local storage root.
    #[arg(
        long,
        env = "MSYNC_STORAGE_DIR",
        default_value = "/var/lib/graphite/whisper"
    )]
    storage_dir: PathBuf,

    /// Storage root on the peers, when it differs from the local one.
    #[arg(long, env = "MSYNC_REMOTE_STORAGE_DIR")]
    remote_storage_dir: Option<PathBuf>,

    /// Directory under which per-peer staging directories are created.
    /// Defaults to a fresh temporary directory.
    #[arg(long, env = "MSYNC_STAGING_ROOT")]
    staging_root: Option<PathBuf>,

    /// Start of the healing window (Unix seconds, inclusive).
    #[arg(long, env = "MSYNC_START_TIME", default_value_t = 0)]
    start_time: u64,

    /// End of the healing window (Unix seconds, inclusive). Defaults to now.
    #[arg(long, env = "MSYNC_END_TIME")]
    end_time: Option<u64>,

    /// Let fetched points win over conflicting local ones inside the window.
    #[arg(long)]
    overwrite: bool,

    /// Regexes of metric names to skip, comma separated or repeated.
    /// Defaults to `^carbon\.`.
    #[arg(long = "exclude", value_name = "REGEX", value_delimiter = ',')]
    excludes: Vec<String>,

    /// Metrics fetched per transfer.
    #[arg(long, env = "MSYNC_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Concurrent transfers per peer.
    #[arg(long, env = "MSYNC_FETCH_WORKERS", default_value_t = MAX_PARALLEL_FETCH)]
    fetch_workers: usize,

    /// Concurrent merge workers per batch. Defaults to the CPU count.
    #[arg(long, env = "MSYNC_HEAL_WORKERS")]
    heal_workers: Option<usize>,

    /// Command run on each peer to list its metric catalogue.
    #[arg(long, env = "MSYNC_CATALOGUE_COMMAND", default_value = "carbon-list")]
    catalogue_command: String,

    /// Local command merging one staged file into its live counterpart.
    #[arg(long, env = "MSYNC_HEAL_COMMAND", default_value = "whisper-fill")]
    heal_command: String,

    /// The heal command cannot restrict itself to a time window; merge
    /// whole files and ignore the window.
    #[arg(long)]
    heal_all_points: bool,

    /// Extra ssh options, space separated.
    #[arg(long, env = "MSYNC_SSH_OPTIONS")]
    ssh_options: Option<String>,

    /// Extra rsync options, space separated.
    #[arg(long, env = "MSYNC_RSYNC_OPTIONS")]
    rsync_options: Option<String>,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,
}

fn split_options(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Compiles exclude patterns, falling back to the internal-metrics
/// prefix when none are given.
fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    let defaults = [r"^carbon\.".to_string()];
    let patterns = if patterns.is_empty() {
        &defaults[..]
    } else {
        patterns
    };
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("bad exclude pattern {p:?}")))
        .collect()
}

/// Per-peer progress bar; one bar at a time, matching the strictly
/// sequential peer order.
struct BarObserver {
    enabled: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl BarObserver {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            bar: Mutex::new(None),
        }
    }
}

impl ProgressObserver for BarObserver {
    fn begin_peer(&self, peer: &str, work_total: u64) {
        if !self.enabled {
            return;
        }
        let bar = ProgressBar::new(work_total);
        let style = ProgressStyle::with_template("{msg:20} [{bar:40}] {percent:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(peer.to_string());
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn update(&self, work_done: u64, _work_total: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.set_position(work_done);
            }
        }
    }

    fn finish_peer(&self, _peer: &str) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    msync_observe::logging::init_tracing();

    let args = Args::parse();

    let node = match &args.node {
        Some(node) => node.clone(),
        None => hostname::get()?.to_string_lossy().into_owned(),
    };

    let directory = ClusterDirectory::load(&args.config)
        .with_context(|| format!("loading cluster directory {}", args.config.display()))?;
    let cluster = directory.cluster(&args.cluster)?;

    // Before any network activity: remote commands and transfers only
    // work under the cluster's ssh identity.
    cluster.ensure_invoking_user(&whoami::username())?;

    // Ownership comes from the local cluster; peers and ssh identity of
    // the fetch side come from the remote cluster (the same one unless
    // pulling from a mirror).
    let remote_name = args.remote_cluster.as_deref().unwrap_or(&args.cluster);
    let remote = directory.cluster(remote_name)?;

    let peers = remote.peers(&node);
    if peers.is_empty() {
        tracing::info!(
            target: "msync",
            cluster = %remote_name,
            node = %node,
            "no peers to sync from"
        );
        return Ok(());
    }

    let sieve = Arc::new(HashRingSieve::new(cluster, &args.cluster, &node)?);

    let end_time = args
        .end_time
        .unwrap_or_else(msync_observe::time::unix_time_secs);
    let window = TimeWindow::new(args.start_time, end_time)?;
    let excludes = compile_excludes(&args.excludes)?;

    let (staging_root, _staging_guard) = match &args.staging_root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("creating staging root {}", root.display()))?;
            (root.clone(), None)
        }
        None => {
            let dir = tempfile::tempdir().context("creating temporary staging root")?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };

    let job = SyncJob {
        peers: peers.clone(),
        remote_user: remote.ssh_user.clone(),
        local_storage_root: args.storage_dir.clone(),
        remote_storage_root: args
            .remote_storage_dir
            .clone()
            .unwrap_or_else(|| args.storage_dir.clone()),
        staging_root,
        window,
        overwrite: args.overwrite,
        excludes,
        ssh_options: match &args.ssh_options {
            Some(raw) => split_options(raw),
            None => default_ssh_options(),
        },
        rsync_options: match &args.rsync_options {
            Some(raw) => split_options(raw),
            None => default_rsync_options(),
        },
    };

    let caps = SyncCaps {
        fetch_concurrency: args.fetch_workers.max(1),
        heal_concurrency: args.heal_workers.unwrap_or_else(available_cpus).max(1),
        batch_size: args.batch_size.max(1),
        catalogue_command: split_options(&args.catalogue_command),
        ..SyncCaps::default()
    };

    let merger = if args.heal_all_points {
        CommandMerger::without_time_window(args.heal_command.clone())
    } else {
        CommandMerger::new(args.heal_command.clone())
    };

    tracing::info!(
        target: "msync",
        event = "run_started",
        cluster = %args.cluster,
        node = %node,
        peers = peers.len(),
        start_time = window.start(),
        end_time = window.end(),
        overwrite = args.overwrite,
        "starting sync run"
    );

    let observer = BarObserver::new(!args.no_progress);
    let syncer = Syncer::new(caps, SshTransport::default(), merger);
    let reports = syncer.run(&job, sieve, &observer).await;

    let aborted = reports.iter().filter(|r| r.error.is_some()).count();
    let heal_failures: usize = reports.iter().map(|r| r.heal_failures.len()).sum();
    tracing::info!(
        target: "msync",
        event = "run_finished",
        cluster = %args.cluster,
        peers = reports.len(),
        aborted,
        heal_failures,
        "sync run finished"
    );

    if aborted > 0 || heal_failures > 0 {
        anyhow::bail!("{aborted} peer(s) aborted, {heal_failures} metric(s) failed to heal");
    }
    Ok(())
}
