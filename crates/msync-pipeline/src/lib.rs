#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod resolve;

use thiserror::Error;

/// Failures that abort a peer's run (heal failures do not; they are
/// isolated per metric and aggregated in the peer report).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(#[from] msync_transport::TransportError),
    #[error("config: {0}")]
    Config(#[from] msync_cluster::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
