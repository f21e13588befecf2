use std::collections::HashSet;
use std::path::PathBuf;

use super::{NodeId, RaftError};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub group: Vec<NodeId>,        // every member, self included
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
    pub store_path: Option<PathBuf>, // term and vote survive restarts when set
}

impl RaftConfig {
    /// Creates a config for a group that so far only contains `node_id`.
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: NodeId::from(node_id),
            group: vec![NodeId::from(node_id)],
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            store_path: None,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str) {
        let peer = NodeId::from(peer_id);
        if !self.group.contains(&peer) {
            self.group.push(peer);
        }
    }

    pub fn with_timeouts(mut self, election_min: u64, election_max: u64, heartbeat: u64) -> Self {
        self.election_timeout_min = election_min;
        self.election_timeout_max = election_max;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn server_count(&self) -> usize {
        self.group.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.group.iter().filter(move |id| **id != self.node_id)
    }

    /// Rejects setups that can never form a working group. Called once at
    /// startup; nothing here is recoverable at runtime.
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.as_str().trim().is_empty() {
            return Err(RaftError::Config("node id is required".to_string()));
        }
        if self.group.is_empty() {
            return Err(RaftError::Config("server group is empty".to_string()));
        }
        if !self.group.contains(&self.node_id) {
            return Err(RaftError::Config(format!(
                "node {} is not a member of its group",
                self.node_id
            )));
        }

        let mut seen = HashSet::new();
        for id in &self.group {
            if id.as_str().trim().is_empty() {
                return Err(RaftError::Config("group contains an empty node id".to_string()));
            }
            if !seen.insert(id) {
                return Err(RaftError::Config(format!("duplicate group member {id}")));
            }
        }

        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "invalid election timeout range {}..={}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} must be positive and below the election timeout",
                self.heartbeat_interval
            )));
        }

        Ok(())
    }
}
