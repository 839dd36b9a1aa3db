use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File extension used by the storage files this tool shuttles around.
///
/// The format itself is owned by the storage-merge collaborator; the
/// extension only matters for the metric-name <-> path mapping.
pub const STORAGE_EXT: &str = "wsp";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetricNameError {
    #[error("metric name must be non-empty")]
    Empty,
    #[error("metric name {0:?} has an empty component")]
    EmptyComponent(String),
    #[error("metric name {0:?} contains a path separator")]
    PathSeparator(String),
}

/// Dot-delimited identifier of one time series, unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricName(String);

impl MetricName {
    pub fn new(name: impl Into<String>) -> Result<Self, MetricNameError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MetricNameError::Empty);
        }
        if name.contains('/') || name.contains('\\') {
            return Err(MetricNameError::PathSeparator(name));
        }
        if name.split('.').any(|c| c.trim().is_empty()) {
            return Err(MetricNameError::EmptyComponent(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Maps `a.b.c` to `a/b/c.wsp`. Inverse of [`MetricPath::to_metric_name`].
    pub fn to_path(&self) -> MetricPath {
        let mut path: PathBuf = self.0.split('.').collect();
        path.set_extension(STORAGE_EXT);
        MetricPath(path)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relative path of one metric's storage file under a storage root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricPath(PathBuf);

impl MetricPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Inverse of [`MetricName::to_path`].
    pub fn to_metric_name(&self) -> Result<MetricName, MetricNameError> {
        let mut stripped = self.0.clone();
        stripped.set_extension("");
        let components: Vec<String> = stripped
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        MetricName::new(components.join("."))
    }
}

impl fmt::Display for MetricPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid time window: start {start} > end {end}")]
pub struct TimeWindowError {
    pub start: u64,
    pub end: u64,
}

/// Inclusive `[start, end]` window of Unix timestamps eligible for healing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: u64,
    end: u64,
}

impl TimeWindow {
    pub fn new(start: u64, end: u64) -> Result<Self, TimeWindowError> {
        if start > end {
            return Err(TimeWindowError { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, ts: u64) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// A peer identity as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub user: String,
    pub host: String,
}

/// One planning unit: a subset of metrics fetched and healed together.
///
/// Batches produced for a single peer run partition the resolved metric
/// set; no path appears in two of them. The planner is the only producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub staging_dir: PathBuf,
    pub metrics: Vec<MetricPath>,
    pub window: TimeWindow,
    pub remote: RemoteNode,
    pub ssh_options: Vec<String>,
    pub rsync_options: Vec<String>,
    pub overwrite: bool,
}

impl Batch {
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }
}
