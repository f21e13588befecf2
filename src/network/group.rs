use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use ::log::{debug, warn};
use tokio::sync::mpsc;

use super::{NetworkError, Router};
use crate::raft::{Envelope, NodeId, RaftEvent, RaftMessage, Rpc, RpcResult};

#[derive(Default)]
struct Members {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<RaftEvent>>,
    isolated: HashSet<NodeId>,
}

/// In-process registry of node inboxes, keyed by node id.
///
/// Stands in for a real transport: every message is handed straight to the
/// target's inbox. Isolating a node drops everything it sends or should
/// receive, which is how tests simulate a network partition.
#[derive(Default)]
pub struct ServerGroup {
    members: RwLock<Members>,
}

impl ServerGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        id: NodeId,
        inbox: mpsc::UnboundedSender<RaftEvent>,
    ) -> Result<(), NetworkError> {
        let mut members = self.write();
        if members.inboxes.contains_key(&id) {
            return Err(NetworkError::DuplicateNode(id.to_string()));
        }
        members.inboxes.insert(id, inbox);
        Ok(())
    }

    pub fn unregister(&self, id: &NodeId) {
        let mut members = self.write();
        members.inboxes.remove(id);
        members.isolated.remove(id);
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.read().inboxes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cuts `id` off from the rest of the group until [`heal`](Self::heal).
    pub fn isolate(&self, id: &NodeId) {
        debug!("Isolating node {id}");
        self.write().isolated.insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        debug!("Reconnecting node {id}");
        self.write().isolated.remove(id);
    }

    pub fn is_isolated(&self, id: &NodeId) -> bool {
        self.read().isolated.contains(id)
    }

    /// Hands `message` to `to`'s inbox. A message crossing an isolated node is
    /// dropped silently, like a lost packet.
    pub fn deliver(&self, from: &NodeId, to: &NodeId, message: RaftMessage) -> Result<(), NetworkError> {
        let members = self.read();
        if members.isolated.contains(from) || members.isolated.contains(to) {
            debug!("Dropping message {from} -> {to}: partitioned");
            return Ok(());
        }

        let inbox = members
            .inboxes
            .get(to)
            .ok_or_else(|| NetworkError::UnknownNode(to.to_string()))?;
        let envelope = Envelope {
            from: from.clone(),
            message,
        };
        inbox
            .send(RaftEvent::Message(envelope))
            .map_err(|_| NetworkError::Disconnected(to.to_string()))
    }

    /// Builds the router a member uses to reach the rest of the group.
    pub fn router(self: &Arc<Self>, self_id: NodeId) -> GroupRouter {
        GroupRouter {
            self_id,
            group: Arc::clone(self),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Members> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Members> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`Router`] bound to one member of a [`ServerGroup`].
pub struct GroupRouter {
    self_id: NodeId,
    group: Arc<ServerGroup>,
}

impl Router for GroupRouter {
    fn send_rpc(&self, rpc: Rpc) {
        let sender = rpc.sender().clone();
        for peer in self.group.members() {
            if peer == sender {
                continue;
            }
            if let Err(e) = self.group.deliver(&sender, &peer, rpc.clone().into()) {
                warn!(
                    "Node {}, failed to send term {} request to {peer}: {e}",
                    self.self_id,
                    rpc.term()
                );
            }
        }
    }

    fn send_result(&self, result: RpcResult, target: &NodeId) {
        if let Err(e) = self.group.deliver(&self.self_id, target, result.into()) {
            warn!(
                "Node {}, failed to send term {} result to {target}: {e}",
                self.self_id,
                result.term()
            );
        }
    }
}
