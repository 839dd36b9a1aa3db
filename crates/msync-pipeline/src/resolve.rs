use std::collections::BTreeSet;

use regex::Regex;

use msync_cluster::sieve::Sieve;
use msync_core::types::{MetricName, RemoteNode};
use msync_transport::Transport;

use crate::SyncError;

/// Drops every metric matching any exclude pattern (substring search, as
/// users write `^carbon\.` style anchors themselves). Idempotent.
pub fn filter_excluded(metrics: Vec<MetricName>, excludes: &[Regex]) -> Vec<MetricName> {
    metrics
        .into_iter()
        .filter(|m| !excludes.iter().any(|re| re.is_match(m.as_str())))
        .collect()
}

/// Asks the peer for its metric catalogue and restricts it to what the
/// local node is responsible for.
///
/// Fail-fast: a catalogue failure aborts the peer's whole run, there is
/// no partial resolution.
pub fn resolve<T: Transport, S: Sieve>(
    transport: &T,
    remote: &RemoteNode,
    catalogue_command: &[String],
    ssh_options: &[String],
    excludes: &[Regex],
    sieve: &S,
) -> Result<Vec<MetricName>, SyncError> {
    let lines = transport.list_remote(remote, catalogue_command, ssh_options)?;

    let mut metrics = Vec::with_capacity(lines.len());
    for line in lines {
        match MetricName::new(line.trim()) {
            Ok(metric) => metrics.push(metric),
            Err(err) => {
                tracing::warn!(
                    target: "msync",
                    event = "bad_catalogue_entry",
                    peer = %remote.host,
                    error = %err,
                    "skipping unparseable catalogue entry"
                );
            }
        }
    }

    let metrics = filter_excluded(metrics, excludes);
    let owned: BTreeSet<MetricName> = metrics.into_iter().filter(|m| sieve.owns(m)).collect();
    Ok(owned.into_iter().collect())
}
