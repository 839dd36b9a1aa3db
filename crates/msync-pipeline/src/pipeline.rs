use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use msync_cluster::sieve::Sieve;
use msync_core::types::{Batch, MetricName, MetricPath, RemoteNode, TimeWindow};
use msync_observe::metrics::{Counter, Gauge};
use msync_transport::{FetchSpec, Transport, TransportError};

use crate::merge::{HealError, StorageMerger};
use crate::plan;
use crate::progress::{ProgressObserver, ProgressTracker};
use crate::resolve;
use crate::SyncError;

/// Fetch pool width. Fixed and small on purpose: this stage is bound by
/// remote session and network capacity, not local compute.
pub const MAX_PARALLEL_FETCH: usize = 4;

/// Immutable per-run tuning, constructed once and handed to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct SyncCaps {
    pub fetch_concurrency: usize,
    pub heal_concurrency: usize,
    pub batch_size: usize,
    /// Share of one metric's work attributed to fetching (0..=100).
    pub fetch_percent: u64,
    /// Command run on the peer to list its metric catalogue.
    pub catalogue_command: Vec<String>,
}

impl Default for SyncCaps {
    fn default() -> Self {
        Self {
            fetch_concurrency: MAX_PARALLEL_FETCH,
            heal_concurrency: available_cpus(),
            batch_size: 1000,
            fetch_percent: 10,
            catalogue_command: vec!["carbon-list".to_string()],
        }
    }
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub batches_fetched_total: Counter,
    pub metrics_fetched_total: Counter,
    pub metrics_healed_total: Counter,
    pub heal_failures_total: Counter,
    pub peers_synced_total: Counter,
    pub peers_failed_total: Counter,
    /// Batches currently in the fetch pool; back to 0 between peers.
    pub fetches_inflight: Gauge,
}

/// One metric whose merge failed. Isolated: the rest of the batch and
/// run continue.
#[derive(Debug)]
pub struct HealFailure {
    pub metric: MetricPath,
    pub error: HealError,
}

#[derive(Debug)]
pub struct PeerReport {
    pub peer: String,
    pub metrics_total: usize,
    pub heal_failures: Vec<HealFailure>,
    /// Set when the peer's run was aborted (resolution or transfer
    /// failure). Heal failures alone never abort a run.
    pub error: Option<SyncError>,
}

impl PeerReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.heal_failures.is_empty()
    }

    fn aborted(peer: &str, metrics_total: usize, error: SyncError) -> Self {
        Self {
            peer: peer.to_string(),
            metrics_total,
            heal_failures: Vec::new(),
            error: Some(error),
        }
    }
}

/// Everything one invocation syncs: which peers, what window, where the
/// trees live.
#[derive(Debug, Clone)]
pub struct SyncJob {
    /// Peer hostnames, local node already excluded.
    pub peers: Vec<String>,
    pub remote_user: String,
    pub local_storage_root: PathBuf,
    pub remote_storage_root: PathBuf,
    pub staging_root: PathBuf,
    pub window: TimeWindow,
    pub overwrite: bool,
    pub excludes: Vec<Regex>,
    pub ssh_options: Vec<String>,
    pub rsync_options: Vec<String>,
}

/// Per-peer staging directory with guaranteed release: removed on drop,
/// so early returns and panics do not leak fetched files.
#[derive(Debug)]
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(root: &Path, peer: &str) -> std::io::Result<Self> {
        let path = root.join(peer);
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, armed: true })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(mut self) -> std::io::Result<()> {
        self.armed = false;
        std::fs::remove_dir_all(&self.path)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

struct PieceOutcome {
    attempted: u64,
    failures: Vec<HealFailure>,
}

/// Drives the full resolve -> plan -> fetch+heal -> cleanup cycle, one
/// peer at a time.
pub struct Syncer<T, M> {
    caps: SyncCaps,
    transport: Arc<T>,
    merger: Arc<M>,
    metrics: Arc<SyncMetrics>,
}

impl<T: Transport, M: StorageMerger> Syncer<T, M> {
    pub fn new(caps: SyncCaps, transport: T, merger: M) -> Self {
        Self {
            caps,
            transport: Arc::new(transport),
            merger: Arc::new(merger),
            metrics: Arc::new(SyncMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.metrics.clone()
    }

    /// Syncs every peer strictly sequentially. No staging directory or
    /// pool for peer n+1 exists before peer n's are torn down.
    pub async fn run<S: Sieve, O: ProgressObserver>(
        &self,
        job: &SyncJob,
        sieve: Arc<S>,
        observer: &O,
    ) -> Vec<PeerReport> {
        let mut reports = Vec::with_capacity(job.peers.len());
        for (index, peer) in job.peers.iter().enumerate() {
            tracing::info!(
                target: "msync",
                event = "peer_started",
                peer = %peer,
                index = index + 1,
                peers = job.peers.len(),
                "syncing node"
            );

            let report = self.run_peer(job, peer, sieve.clone(), observer).await;

            match &report.error {
                None => self.metrics.peers_synced_total.inc(),
                Some(error) => {
                    self.metrics.peers_failed_total.inc();
                    tracing::error!(
                        target: "msync",
                        event = "peer_aborted",
                        peer = %peer,
                        error = %error,
                        "peer run aborted"
                    );
                }
            }
            tracing::info!(
                target: "msync",
                event = "peer_summary",
                peer = %peer,
                metrics = report.metrics_total,
                heal_failures = report.heal_failures.len(),
                aborted = report.error.is_some(),
                "done"
            );
            reports.push(report);
        }
        reports
    }

    async fn run_peer<S: Sieve, O: ProgressObserver>(
        &self,
        job: &SyncJob,
        peer: &str,
        sieve: Arc<S>,
        observer: &O,
    ) -> PeerReport {
        let remote = RemoteNode {
            user: job.remote_user.clone(),
            host: peer.to_string(),
        };

        let resolved = {
            let transport = self.transport.clone();
            let remote = remote.clone();
            let command = self.caps.catalogue_command.clone();
            let ssh_options = job.ssh_options.clone();
            let excludes = job.excludes.clone();
            let handle = tokio::task::spawn_blocking(move || {
                resolve::resolve(
                    transport.as_ref(),
                    &remote,
                    &command,
                    &ssh_options,
                    &excludes,
                    sieve.as_ref(),
                )
            });
            match handle.await {
                Ok(Ok(metrics)) => metrics,
                Ok(Err(err)) => return PeerReport::aborted(peer, 0, err),
                Err(err) => return PeerReport::aborted(peer, 0, err.into()),
            }
        };

        let tracker = ProgressTracker::new(resolved.len() as u64, self.caps.fetch_percent);
        observer.begin_peer(peer, tracker.work_total());
        observer.update(tracker.work_done(), tracker.work_total());
        tracing::info!(
            target: "msync",
            event = "metrics_resolved",
            peer = %peer,
            metrics = resolved.len(),
            "fetching and merging"
        );

        let staging = match StagingDir::create(&job.staging_root, peer) {
            Ok(staging) => staging,
            Err(err) => return PeerReport::aborted(peer, resolved.len(), err.into()),
        };

        let full = Batch {
            staging_dir: staging.path().to_path_buf(),
            metrics: resolved.iter().map(MetricName::to_path).collect(),
            window: job.window,
            remote,
            ssh_options: job.ssh_options.clone(),
            rsync_options: job.rsync_options.clone(),
            overwrite: job.overwrite,
        };
        let batches = plan::plan(&full, self.caps.batch_size);

        let mut heal_failures = Vec::new();
        let result = self
            .fetch_merge(job, peer, batches, &tracker, observer, &mut heal_failures)
            .await;

        // Guaranteed release: staging goes away whether or not the
        // pipeline succeeded.
        if let Err(err) = staging.remove() {
            tracing::warn!(
                target: "msync",
                event = "staging_cleanup_failed",
                peer = %peer,
                error = %err,
                "could not remove staging directory"
            );
        } else {
            tracing::info!(target: "msync", event = "peer_cleaned", peer = %peer, "cleaned up");
        }
        observer.finish_peer(peer);

        // Heal failures collected before an abort still belong in the
        // summary.
        PeerReport {
            peer: peer.to_string(),
            metrics_total: resolved.len(),
            heal_failures,
            error: result.err(),
        }
    }

    /// The two-stage pipeline: a bounded fetch pool feeds fetched
    /// batches to the heal pool in completion order; heal of batch i
    /// overlaps fetch of batch i+1.
    async fn fetch_merge<O: ProgressObserver>(
        &self,
        job: &SyncJob,
        peer: &str,
        batches: Vec<Batch>,
        tracker: &ProgressTracker,
        observer: &O,
        heal_failures: &mut Vec<HealFailure>,
    ) -> Result<(), SyncError> {
        let fetch_width = self.caps.fetch_concurrency.max(1);
        let heal_width = self.caps.heal_concurrency.max(1);

        let (tx, mut rx) = mpsc::channel::<Batch>(fetch_width);
        let transport = self.transport.clone();
        let remote_root = job.remote_storage_root.clone();
        let metrics = self.metrics.clone();

        let producer = tokio::spawn(async move {
            let mut pending = batches.into_iter();
            let mut pool: JoinSet<Result<Batch, TransportError>> = JoinSet::new();
            loop {
                while pool.len() < fetch_width {
                    let Some(batch) = pending.next() else { break };
                    let transport = transport.clone();
                    let remote_root = remote_root.clone();
                    pool.spawn_blocking(move || {
                        let spec = FetchSpec {
                            remote: &batch.remote,
                            storage_root: &remote_root,
                            files: &batch.metrics,
                            staging_dir: &batch.staging_dir,
                            ssh_options: &batch.ssh_options,
                            rsync_options: &batch.rsync_options,
                        };
                        transport.fetch_files(spec)?;
                        Ok(batch)
                    });
                }
                metrics.fetches_inflight.set(pool.len() as u64);

                let Some(joined) = pool.join_next().await else {
                    break;
                };
                let batch = match joined {
                    Ok(Ok(batch)) => batch,
                    Ok(Err(err)) => {
                        pool.shutdown().await;
                        metrics.fetches_inflight.set(0);
                        return Err(SyncError::from(err));
                    }
                    Err(err) => {
                        pool.shutdown().await;
                        metrics.fetches_inflight.set(0);
                        return Err(SyncError::from(err));
                    }
                };
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
            metrics.fetches_inflight.set(0);
            Ok(())
        });

        while let Some(batch) = rx.recv().await {
            let fetched = batch.metric_count() as u64;
            tracker.on_fetched(fetched);
            self.metrics.batches_fetched_total.inc();
            self.metrics.metrics_fetched_total.inc_by(fetched);
            observer.update(tracker.work_done(), tracker.work_total());
            tracing::info!(
                target: "msync",
                event = "batch_fetched",
                peer = %peer,
                metrics = fetched,
                "fetched batch"
            );

            let mut pool: JoinSet<PieceOutcome> = JoinSet::new();
            for piece in plan::rechunk(&batch, heal_width) {
                let merger = self.merger.clone();
                let local_root = job.local_storage_root.clone();
                pool.spawn_blocking(move || heal_piece(merger.as_ref(), &piece, &local_root));
            }

            // Batch-granularity barrier: every heal piece of this batch
            // completes before its progress is finalized. Pieces are all
            // about the same size, so they finish together; the fetch
            // pool keeps running meanwhile.
            while let Some(joined) = pool.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        producer.abort();
                        return Err(err.into());
                    }
                };
                tracker.on_healed(outcome.attempted);
                self.metrics
                    .metrics_healed_total
                    .inc_by(outcome.attempted.saturating_sub(outcome.failures.len() as u64));
                self.metrics
                    .heal_failures_total
                    .inc_by(outcome.failures.len() as u64);
                observer.update(tracker.work_done(), tracker.work_total());
                heal_failures.extend(outcome.failures);
            }
            tracing::info!(
                target: "msync",
                event = "batch_healed",
                peer = %peer,
                metrics = fetched,
                "healed batch"
            );
        }

        producer.await??;
        Ok(())
    }
}

fn heal_piece<M: StorageMerger>(merger: &M, piece: &Batch, local_root: &Path) -> PieceOutcome {
    let mut failures = Vec::new();
    for metric in &piece.metrics {
        let staged = piece.staging_dir.join(metric.as_path());
        let local = local_root.join(metric.as_path());
        if let Err(error) = merger.heal(&staged, &local, Some(piece.window), piece.overwrite) {
            tracing::warn!(
                target: "msync",
                event = "heal_failed",
                metric = %metric,
                error = %error,
                "metric heal failed"
            );
            failures.push(HealFailure {
                metric: metric.clone(),
                error,
            });
        }
    }
    PieceOutcome {
        attempted: piece.metric_count() as u64,
        failures,
    }
}
