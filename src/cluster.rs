use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ::log::{info, warn};
use tokio::time::{sleep, Instant};

use crate::network::ServerGroup;
use crate::raft::{NodeId, NodeRole, Raft, RaftConfig, RaftError, ServerStateSnapshot, Term};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A whole group of nodes running inside one process.
pub struct LocalCluster {
    group: Arc<ServerGroup>,
    nodes: BTreeMap<NodeId, Raft>,
}

impl LocalCluster {
    /// Starts one node per config on a fresh group. If any node fails to
    /// start, the ones already running are shut down again.
    pub async fn start(configs: Vec<RaftConfig>) -> Result<Self, RaftError> {
        let group = ServerGroup::new();
        let mut cluster = Self {
            group,
            nodes: BTreeMap::new(),
        };

        for config in configs {
            match Raft::start(config, &cluster.group) {
                Ok(raft) => {
                    cluster.nodes.insert(raft.id().clone(), raft);
                }
                Err(e) => {
                    cluster.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!("Local cluster started with {} nodes", cluster.nodes.len());
        Ok(cluster)
    }

    pub fn group(&self) -> &Arc<ServerGroup> {
        &self.group
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Raft> {
        self.nodes.get(id)
    }

    pub async fn snapshots(&self) -> Vec<(NodeId, ServerStateSnapshot)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for (id, raft) in &self.nodes {
            match raft.snapshot().await {
                Ok(snapshot) => out.push((id.clone(), snapshot)),
                Err(e) => warn!("Node {id} unavailable: {e}"),
            }
        }
        out
    }

    /// Every node that currently believes it leads, with its term.
    pub async fn leaders(&self) -> Vec<(NodeId, Term)> {
        self.snapshots()
            .await
            .into_iter()
            .filter(|(_, s)| s.role == NodeRole::Leader)
            .map(|(id, s)| (id, s.term))
            .collect()
    }

    /// Waits until exactly one connected node leads, in the newest term seen
    /// among connected nodes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<(NodeId, Term)> {
        self.wait_for_leader_after(0, timeout).await
    }

    /// Like [`wait_for_leader`](Self::wait_for_leader), but only accepts a
    /// leader whose term is at least `min_term`.
    pub async fn wait_for_leader_after(
        &self,
        min_term: Term,
        timeout: Duration,
    ) -> Option<(NodeId, Term)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.settled_leader().await {
                if leader.1 >= min_term {
                    return Some(leader);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn settled_leader(&self) -> Option<(NodeId, Term)> {
        let connected: Vec<(NodeId, ServerStateSnapshot)> = self
            .snapshots()
            .await
            .into_iter()
            .filter(|(id, _)| !self.group.is_isolated(id))
            .collect();
        let newest = connected.iter().map(|(_, s)| s.term).max()?;

        let mut leaders = connected
            .iter()
            .filter(|(_, s)| s.role == NodeRole::Leader && s.term == newest);
        let (id, snapshot) = leaders.next()?;
        if leaders.next().is_some() {
            return None;
        }

        // Everyone else must have heard from this leader.
        let followed = connected
            .iter()
            .filter(|(other, _)| other != id)
            .all(|(_, s)| s.term == newest && s.leader_id.as_ref() == Some(id));
        followed.then(|| (id.clone(), snapshot.term))
    }

    pub fn isolate(&self, id: &NodeId) {
        self.group.isolate(id);
    }

    pub fn heal(&self, id: &NodeId) {
        self.group.heal(id);
    }

    /// Stops one node and removes it from the group.
    pub async fn stop_node(&mut self, id: &NodeId) -> Result<(), RaftError> {
        match self.nodes.remove(id) {
            Some(raft) => raft.shutdown().await,
            None => Err(RaftError::NotRunning),
        }
    }

    pub async fn shutdown(&mut self) {
        for (id, raft) in std::mem::take(&mut self.nodes) {
            if let Err(e) = raft.shutdown().await {
                warn!("Node {id} did not shut down cleanly: {e}");
            }
        }
    }
}
