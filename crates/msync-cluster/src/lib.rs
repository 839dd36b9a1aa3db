#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod sieve;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown cluster {0:?}")]
    UnknownCluster(String),
    #[error("cluster {0:?} has no nodes")]
    EmptyCluster(String),
    #[error("cluster {cluster:?} replication_factor {factor} exceeds node count {nodes}")]
    BadReplicationFactor {
        cluster: String,
        factor: usize,
        nodes: usize,
    },
    #[error("node {node:?} is not part of cluster {cluster:?}")]
    UnknownNode { cluster: String, node: String },
    #[error("this program must run as user {expected:?}, not {actual:?}")]
    WrongUser { expected: String, actual: String },
    #[error("cannot parse cluster file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One cluster entry in the directory file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<String>,
    pub ssh_user: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
}

fn default_replication_factor() -> usize {
    1
}

impl ClusterConfig {
    /// Hostnames of every node except `local_node`, sorted for determinism.
    pub fn peers(&self, local_node: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.as_str() != local_node)
            .cloned()
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// The identity guard: aborts before any network activity when the
    /// invoking user is not the cluster's ssh user.
    pub fn ensure_invoking_user(&self, actual: &str) -> Result<(), ConfigError> {
        if actual != self.ssh_user {
            return Err(ConfigError::WrongUser {
                expected: self.ssh_user.clone(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Cluster-directory collaborator: cluster name -> peers + ssh user.
#[derive(Debug, Clone)]
pub struct ClusterDirectory {
    clusters: BTreeMap<String, ClusterConfig>,
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    clusters: BTreeMap<String, ClusterConfig>,
}

impl ClusterDirectory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: DirectoryFile = toml::from_str(text)?;
        let dir = Self {
            clusters: file.clusters,
        };
        for (name, cluster) in &dir.clusters {
            if cluster.nodes.is_empty() {
                return Err(ConfigError::EmptyCluster(name.clone()));
            }
            if cluster.replication_factor == 0 || cluster.replication_factor > cluster.nodes.len()
            {
                return Err(ConfigError::BadReplicationFactor {
                    cluster: name.clone(),
                    factor: cluster.replication_factor,
                    nodes: cluster.nodes.len(),
                });
            }
        }
        Ok(dir)
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig, ConfigError> {
        self.clusters
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCluster(name.to_string()))
    }
}
