use std::sync::atomic::{AtomicU64, Ordering};

/// Display hook for a run. The CLI attaches a progress bar; library users
/// and tests can ignore it.
pub trait ProgressObserver: Send + Sync + 'static {
    fn begin_peer(&self, _peer: &str, _work_total: u64) {}
    fn update(&self, _work_done: u64, _work_total: u64) {}
    fn finish_peer(&self, _peer: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Weighted completion estimate across the fetch and heal stages.
///
/// Work is counted in fixed-point units: each metric is worth 100, split
/// `fetch_units` / `heal_units` between the stages. `work_done` only
/// ever grows and reads clamp to `work_total`, so displays stay
/// monotonic even if stages over-report.
#[derive(Debug)]
pub struct ProgressTracker {
    done: AtomicU64,
    total: u64,
    fetch_units: u64,
    heal_units: u64,
}

impl ProgressTracker {
    /// `fetch_percent` is the share of one metric's work attributed to
    /// the fetch stage (default 10); healing gets the remainder.
    pub fn new(metric_count: u64, fetch_percent: u64) -> Self {
        let fetch_units = fetch_percent.min(100);
        Self {
            done: AtomicU64::new(0),
            total: metric_count.saturating_mul(100),
            fetch_units,
            heal_units: 100 - fetch_units,
        }
    }

    pub fn on_fetched(&self, metrics: u64) {
        self.done
            .fetch_add(metrics.saturating_mul(self.fetch_units), Ordering::Relaxed);
    }

    pub fn on_healed(&self, metrics: u64) {
        self.done
            .fetch_add(metrics.saturating_mul(self.heal_units), Ordering::Relaxed);
    }

    pub fn work_total(&self) -> u64 {
        self.total
    }

    pub fn work_done(&self) -> u64 {
        self.done.load(Ordering::Relaxed).min(self.total)
    }

    /// Integer-truncated percentage. A run with no work is complete.
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        self.work_done() * 100 / self.total
    }
}
