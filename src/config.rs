use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::{NodeId, RaftConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Static description of a group, shared by all of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Where each node keeps its term and vote, as `<data_dir>/<id>.json`.
    /// Without it nothing survives a restart.
    pub data_dir: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")],
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            data_dir: None,
        }
    }
}

impl ClusterConfig {
    pub fn with_nodes(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    /// Reads a JSON config file. Missing fields fall back to the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Per-node config for member `id`, already validated.
    pub fn node_config(&self, id: &NodeId) -> Result<RaftConfig, ConfigError> {
        let mut config = RaftConfig::new(id.as_str()).with_timeouts(
            self.election_timeout_min_ms,
            self.election_timeout_max_ms,
            self.heartbeat_interval_ms,
        );
        config.group = self.nodes.clone();
        if let Some(dir) = &self.data_dir {
            config = config.with_store_path(dir.join(format!("{id}.json")));
        }
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    pub fn node_configs(&self) -> Result<Vec<RaftConfig>, ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".to_string()));
        }
        self.nodes.iter().map(|id| self.node_config(id)).collect()
    }
}

/// Parses a comma separated id list such as `a,b,c`.
pub fn parse_node_list(raw: &str) -> Vec<NodeId> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(NodeId::from)
        .collect()
}
