//! End-to-end pipeline runs against a filesystem-backed fake transport
//! and a plain-text storage merger.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use msync_cluster::sieve::Sieve;
use msync_core::types::{MetricName, RemoteNode, TimeWindow};
use msync_pipeline::merge::{HealError, MergerCapabilities, StorageMerger};
use msync_pipeline::pipeline::{SyncCaps, SyncJob, Syncer};
use msync_pipeline::progress::{NoopObserver, ProgressObserver};
use msync_transport::{FetchSpec, Transport, TransportError};

/// Copies files out of a local directory standing in for the peer's
/// storage tree.
struct FakeTransport {
    catalogue: Vec<String>,
    /// Fetch calls with index >= this fail; None never fails.
    fail_from_fetch: Option<usize>,
    fetch_calls: AtomicUsize,
}

impl FakeTransport {
    fn new(catalogue: &[&str]) -> Self {
        Self {
            catalogue: catalogue.iter().map(|s| s.to_string()).collect(),
            fail_from_fetch: None,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    fn failing_fetch(catalogue: &[&str]) -> Self {
        Self {
            fail_from_fetch: Some(0),
            ..Self::new(catalogue)
        }
    }

    fn failing_from_fetch(catalogue: &[&str], n: usize) -> Self {
        Self {
            fail_from_fetch: Some(n),
            ..Self::new(catalogue)
        }
    }
}

impl Transport for FakeTransport {
    fn list_remote(
        &self,
        _remote: &RemoteNode,
        _command: &[String],
        _ssh_options: &[String],
    ) -> Result<Vec<String>, TransportError> {
        Ok(self.catalogue.clone())
    }

    fn fetch_files(&self, spec: FetchSpec<'_>) -> Result<(), TransportError> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from_fetch.is_some_and(|n| call >= n) {
            return Err(TransportError::CommandFailed {
                command: "rsync".to_string(),
                output: "connection refused".to_string(),
            });
        }
        for file in spec.files {
            let src = spec.storage_root.join(file.as_path());
            let dst = spec.staging_dir.join(file.as_path());
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }
        Ok(())
    }
}

/// One point per line, `timestamp value`, sorted by timestamp.
fn read_points(path: &Path) -> std::io::Result<BTreeMap<u64, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut points = BTreeMap::new();
    for line in std::fs::read_to_string(path)?.lines() {
        let mut parts = line.split_whitespace();
        let ts = parts
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, line.to_string()))?;
        let value = parts.next().unwrap_or_default().to_string();
        points.insert(ts, value);
    }
    Ok(points)
}

fn write_points(path: &Path, points: &BTreeMap<u64, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body: String = points.iter().map(|(ts, v)| format!("{ts} {v}\n")).collect();
    std::fs::write(path, body)
}

/// Backfills the local file from the staged copy following the gap-heal
/// rules: add missing points inside the window, keep local values on
/// conflict unless overwriting.
struct TextMerger;

impl StorageMerger for TextMerger {
    fn capabilities(&self) -> MergerCapabilities {
        MergerCapabilities { time_window: true }
    }

    fn heal(
        &self,
        staged: &Path,
        local: &Path,
        window: Option<TimeWindow>,
        overwrite: bool,
    ) -> Result<(), HealError> {
        let staged_points = read_points(staged)?;
        let mut local_points = read_points(local)?;
        for (ts, value) in staged_points {
            if let Some(window) = window {
                if !window.contains(ts) {
                    continue;
                }
            }
            match local_points.entry(ts) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => {
                    if overwrite {
                        slot.insert(value);
                    }
                }
            }
        }
        write_points(local, &local_points)?;
        Ok(())
    }
}

/// Fails every metric whose file name matches, healing the rest.
struct SelectiveMerger {
    poison: String,
    inner: TextMerger,
}

impl StorageMerger for SelectiveMerger {
    fn capabilities(&self) -> MergerCapabilities {
        self.inner.capabilities()
    }

    fn heal(
        &self,
        staged: &Path,
        local: &Path,
        window: Option<TimeWindow>,
        overwrite: bool,
    ) -> Result<(), HealError> {
        if staged.to_string_lossy().contains(&self.poison) {
            return Err(HealError::Merge(format!("corrupt header: {}", staged.display())));
        }
        self.inner.heal(staged, local, window, overwrite)
    }
}

struct OwnAll;

impl Sieve for OwnAll {
    fn owns(&self, _metric: &MetricName) -> bool {
        true
    }
}

/// Owns only metrics whose name contains the marker.
struct OwnMatching(&'static str);

impl Sieve for OwnMatching {
    fn owns(&self, metric: &MetricName) -> bool {
        metric.as_str().contains(self.0)
    }
}

#[derive(Default)]
struct RecordingObserver {
    updates: Mutex<Vec<(u64, u64)>>,
}

impl ProgressObserver for RecordingObserver {
    fn update(&self, work_done: u64, work_total: u64) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((work_done, work_total));
        }
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    remote_root: PathBuf,
    local_root: PathBuf,
    staging_root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let remote_root = root.path().join("remote");
        let local_root = root.path().join("local");
        let staging_root = root.path().join("staging");
        for dir in [&remote_root, &local_root, &staging_root] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            _root: root,
            remote_root,
            local_root,
            staging_root,
        }
    }

    fn job(&self, window: TimeWindow, overwrite: bool) -> SyncJob {
        SyncJob {
            peers: vec!["web-b".to_string()],
            remote_user: "graphite".to_string(),
            local_storage_root: self.local_root.clone(),
            remote_storage_root: self.remote_root.clone(),
            staging_root: self.staging_root.clone(),
            window,
            overwrite,
            excludes: vec![Regex::new(r"^carbon\.").unwrap()],
            ssh_options: Vec::new(),
            rsync_options: Vec::new(),
        }
    }

    fn metric_file(&self, side: &str, metric: &str) -> PathBuf {
        let root = if side == "remote" {
            &self.remote_root
        } else {
            &self.local_root
        };
        root.join(MetricName::new(metric).unwrap().to_path().as_path())
    }

    fn seed(&self, side: &str, metric: &str, points: &[(u64, &str)]) {
        let map: BTreeMap<u64, String> = points
            .iter()
            .map(|(ts, v)| (*ts, v.to_string()))
            .collect();
        write_points(&self.metric_file(side, metric), &map).unwrap();
    }

    fn points(&self, side: &str, metric: &str) -> Vec<(u64, String)> {
        read_points(&self.metric_file(side, metric))
            .unwrap()
            .into_iter()
            .collect()
    }
}

fn small_caps() -> SyncCaps {
    SyncCaps {
        batch_size: 2,
        heal_concurrency: 2,
        ..SyncCaps::default()
    }
}

const T: u64 = 1_000_000;

#[tokio::test]
async fn heals_gaps_without_touching_existing_points() {
    let fx = Fixture::new();
    // Local lost its two most recent points; the peer disagrees on t-5
    // and never saw t-4. Out-of-window t-20 must not come over.
    fx.seed("local", "a.b", &[(T - 6, "6"), (T - 5, "5"), (T - 4, "4"), (T - 3, "3")]);
    fx.seed(
        "remote",
        "a.b",
        &[(T - 20, "9"), (T - 6, "6"), (T - 5, "6"), (T - 3, "3"), (T - 2, "2"), (T - 1, "1")],
    );

    let window = TimeWindow::new(T - 10, T).unwrap();
    let syncer = Syncer::new(small_caps(), FakeTransport::new(&["a.b"]), TextMerger);
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &NoopObserver)
        .await;

    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_clean(), "error: {:?}", reports[0].error);
    assert_eq!(reports[0].metrics_total, 1);

    assert_eq!(
        fx.points("local", "a.b"),
        vec![
            (T - 6, "6".to_string()),
            (T - 5, "5".to_string()), // local value kept on conflict
            (T - 4, "4".to_string()),
            (T - 3, "3".to_string()),
            (T - 2, "2".to_string()),
            (T - 1, "1".to_string()),
        ]
    );

    // Staging is gone, remote untouched.
    assert!(!fx.staging_root.join("web-b").exists());
    assert_eq!(fx.points("remote", "a.b").len(), 6);

    let metrics = syncer.metrics();
    assert_eq!(metrics.metrics_fetched_total.get(), 1);
    assert_eq!(metrics.metrics_healed_total.get(), 1);
    assert_eq!(metrics.heal_failures_total.get(), 0);
    assert_eq!(metrics.peers_synced_total.get(), 1);
}

#[tokio::test]
async fn overwrite_lets_staged_points_win_inside_the_window() {
    let fx = Fixture::new();
    fx.seed("local", "a.b", &[(T - 5, "5"), (T - 4, "4")]);
    fx.seed("remote", "a.b", &[(T - 20, "9"), (T - 5, "6"), (T - 1, "1")]);

    let window = TimeWindow::new(T - 10, T).unwrap();
    let syncer = Syncer::new(small_caps(), FakeTransport::new(&["a.b"]), TextMerger);
    let reports = syncer
        .run(&fx.job(window, true), Arc::new(OwnAll), &NoopObserver)
        .await;
    assert!(reports[0].is_clean());

    assert_eq!(
        fx.points("local", "a.b"),
        vec![
            (T - 5, "6".to_string()), // staged value wins
            (T - 4, "4".to_string()), // only local, untouched
            (T - 1, "1".to_string()),
        ]
    );
}

#[tokio::test]
async fn healing_twice_changes_nothing_more() {
    let fx = Fixture::new();
    fx.seed("local", "a.b", &[(T - 5, "5")]);
    fx.seed("remote", "a.b", &[(T - 5, "6"), (T - 2, "2")]);

    let window = TimeWindow::new(T - 10, T).unwrap();
    let job = fx.job(window, false);

    let first = Syncer::new(small_caps(), FakeTransport::new(&["a.b"]), TextMerger);
    assert!(first.run(&job, Arc::new(OwnAll), &NoopObserver).await[0].is_clean());
    let after_first = fx.points("local", "a.b");

    let second = Syncer::new(small_caps(), FakeTransport::new(&["a.b"]), TextMerger);
    assert!(second.run(&job, Arc::new(OwnAll), &NoopObserver).await[0].is_clean());
    assert_eq!(fx.points("local", "a.b"), after_first);
}

#[tokio::test]
async fn heal_failures_are_isolated_per_metric() {
    let fx = Fixture::new();
    for metric in ["a.one", "a.two", "a.three"] {
        fx.seed("remote", metric, &[(T - 2, "2")]);
    }

    let window = TimeWindow::new(T - 10, T).unwrap();
    let merger = SelectiveMerger {
        poison: "two".to_string(),
        inner: TextMerger,
    };
    let syncer = Syncer::new(small_caps(), FakeTransport::new(&["a.one", "a.two", "a.three"]), merger);
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &NoopObserver)
        .await;

    let report = &reports[0];
    assert!(report.error.is_none(), "heal failures must not abort the run");
    assert_eq!(report.heal_failures.len(), 1);
    assert_eq!(report.heal_failures[0].metric.to_metric_name().unwrap().as_str(), "a.two");

    // The healthy metrics were still healed.
    assert_eq!(fx.points("local", "a.one"), vec![(T - 2, "2".to_string())]);
    assert_eq!(fx.points("local", "a.three"), vec![(T - 2, "2".to_string())]);
    assert!(fx.points("local", "a.two").is_empty());

    let metrics = syncer.metrics();
    assert_eq!(metrics.metrics_healed_total.get(), 2);
    assert_eq!(metrics.heal_failures_total.get(), 1);
    assert_eq!(metrics.peers_synced_total.get(), 1);
}

#[tokio::test]
async fn fetch_failure_aborts_the_peer_and_removes_staging() {
    let fx = Fixture::new();
    let window = TimeWindow::new(T - 10, T).unwrap();
    let syncer = Syncer::new(
        small_caps(),
        FakeTransport::failing_fetch(&["a.one", "a.two"]),
        TextMerger,
    );
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &NoopObserver)
        .await;

    let report = &reports[0];
    assert!(report.error.is_some());
    assert!(report.heal_failures.is_empty());
    assert!(!fx.staging_root.join("web-b").exists());
    assert_eq!(syncer.metrics().peers_failed_total.get(), 1);
    assert!(fx.points("local", "a.one").is_empty());
}

#[tokio::test]
async fn aborted_peer_keeps_heal_failures_from_earlier_batches() {
    let fx = Fixture::new();
    for metric in ["a.one", "a.three", "a.two"] {
        fx.seed("remote", metric, &[(T - 2, "2")]);
    }

    // One transfer at a time so the first batch is fetched and healed
    // before the second one's transfer fails.
    let caps = SyncCaps {
        fetch_concurrency: 1,
        batch_size: 2,
        heal_concurrency: 2,
        ..SyncCaps::default()
    };
    let merger = SelectiveMerger {
        poison: "one".to_string(),
        inner: TextMerger,
    };
    let window = TimeWindow::new(T - 10, T).unwrap();
    let syncer = Syncer::new(
        caps,
        FakeTransport::failing_from_fetch(&["a.one", "a.three", "a.two"], 1),
        merger,
    );
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &NoopObserver)
        .await;

    let report = &reports[0];
    assert!(report.error.is_some());
    assert_eq!(report.heal_failures.len(), 1);
    assert_eq!(
        report.heal_failures[0].metric.to_metric_name().unwrap().as_str(),
        "a.one"
    );

    // The first batch's healthy metric landed before the abort.
    assert_eq!(fx.points("local", "a.three"), vec![(T - 2, "2".to_string())]);
    assert!(fx.points("local", "a.two").is_empty());
    assert!(!fx.staging_root.join("web-b").exists());
}

#[tokio::test]
async fn peer_with_nothing_eligible_finishes_clean() {
    let fx = Fixture::new();
    let window = TimeWindow::new(T - 10, T).unwrap();
    // Catalogue only has internal metrics caught by the default exclude.
    let syncer = Syncer::new(
        small_caps(),
        FakeTransport::new(&["carbon.agents.web-b.cpuUsage"]),
        TextMerger,
    );
    let observer = RecordingObserver::default();
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &observer)
        .await;

    let report = &reports[0];
    assert!(report.is_clean());
    assert_eq!(report.metrics_total, 0);
    assert!(!fx.staging_root.join("web-b").exists());

    let updates = observer.updates.lock().unwrap();
    assert!(updates.iter().all(|(done, total)| (*done, *total) == (0, 0)));
}

#[tokio::test]
async fn only_owned_metrics_are_fetched() {
    let fx = Fixture::new();
    fx.seed("remote", "servers.mine.cpu", &[(T - 2, "2")]);
    fx.seed("remote", "servers.other.cpu", &[(T - 2, "2")]);

    let window = TimeWindow::new(T - 10, T).unwrap();
    let syncer = Syncer::new(
        small_caps(),
        FakeTransport::new(&["servers.mine.cpu", "servers.other.cpu"]),
        TextMerger,
    );
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnMatching("mine")), &NoopObserver)
        .await;

    assert!(reports[0].is_clean());
    assert_eq!(reports[0].metrics_total, 1);
    assert_eq!(fx.points("local", "servers.mine.cpu"), vec![(T - 2, "2".to_string())]);
    assert!(fx.points("local", "servers.other.cpu").is_empty());
}

#[tokio::test]
async fn many_metrics_flow_through_small_batches() {
    let fx = Fixture::new();
    let names: Vec<String> = (0..17).map(|i| format!("servers.host{i:02}.cpu")).collect();
    for name in &names {
        fx.seed("remote", name, &[(T - 3, "3"), (T - 1, "1")]);
        fx.seed("local", name, &[(T - 3, "3")]);
    }
    let catalogue: Vec<&str> = names.iter().map(String::as_str).collect();

    let window = TimeWindow::new(T - 10, T).unwrap();
    let observer = RecordingObserver::default();
    let syncer = Syncer::new(small_caps(), FakeTransport::new(&catalogue), TextMerger);
    let reports = syncer
        .run(&fx.job(window, false), Arc::new(OwnAll), &observer)
        .await;

    assert!(reports[0].is_clean());
    assert_eq!(reports[0].metrics_total, 17);
    for name in &names {
        assert_eq!(
            fx.points("local", name),
            vec![(T - 3, "3".to_string()), (T - 1, "1".to_string())]
        );
    }

    let metrics = syncer.metrics();
    // batch_size 2 -> ceil(17/2) batches
    assert_eq!(metrics.batches_fetched_total.get(), 9);
    assert_eq!(metrics.metrics_fetched_total.get(), 17);
    assert_eq!(metrics.metrics_healed_total.get(), 17);
    assert_eq!(metrics.fetches_inflight.get(), 0, "fetch pool drained");

    // Progress never moves backwards and lands on completion.
    let updates = observer.updates.lock().unwrap();
    assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(updates.last().unwrap(), &(1700, 1700));
}
