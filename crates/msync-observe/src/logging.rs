use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `MSYNC_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for sync runs:
/// - Always include `peer` on any per-node event.
/// - Include `cluster` on run-level events.
/// - Include `metrics` (count) on batch and summary events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("MSYNC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
