mod config;
mod error;
mod node;
mod rpc;
mod scheduler;
mod state;
mod store;

pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::node::{RaftEvent, RaftNode};
pub use self::rpc::{
    AppendEntriesResult, AppendEntriesRpc, Envelope, NodeId, RaftMessage, RequestVoteResult,
    RequestVoteRpc, Rpc, RpcResult, Term,
};
pub use self::scheduler::{ElectionTimeout, LogReplicationTask, Scheduler, TimerHandle, TimerId};
pub use self::state::{NodeRole, ServerState, ServerStateContext, ServerStateSnapshot};
pub use self::store::{PersistentState, ServerStore};

use std::sync::Arc;

use ::log::info;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::network::ServerGroup;

/// Handle to one running node in a [`ServerGroup`].
pub struct Raft {
    id: NodeId,
    events: mpsc::UnboundedSender<RaftEvent>,
    state: watch::Receiver<ServerStateSnapshot>,
    group: Arc<ServerGroup>,
    task: JoinHandle<()>,
}

impl Raft {
    /// Validates `config`, joins `group` and spawns the node's driving loop.
    pub fn start(config: RaftConfig, group: &Arc<ServerGroup>) -> Result<Self, RaftError> {
        config.validate()?;
        let store = match &config.store_path {
            Some(path) => ServerStore::open(path)?,
            None => ServerStore::in_memory(),
        };

        let (events, inbox) = mpsc::unbounded_channel();
        group.register(config.node_id.clone(), events.clone())?;

        let router = Box::new(group.router(config.node_id.clone()));
        let (node, state) = RaftNode::new(&config, store, router, events.clone(), inbox);
        info!(
            "Starting node {} in a group of {}",
            config.node_id,
            config.server_count()
        );
        let task = tokio::spawn(node.run());

        Ok(Self {
            id: config.node_id,
            events,
            state,
            group: Arc::clone(group),
            task,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Last reported state. Timer-only follower resets are not reported.
    pub fn current(&self) -> ServerStateSnapshot {
        self.state.borrow().clone()
    }

    /// Receives a notification on every non-trivial state change.
    pub fn subscribe(&self) -> watch::Receiver<ServerStateSnapshot> {
        self.state.clone()
    }

    /// Reads the state straight from the driving loop, in inbox order.
    pub async fn snapshot(&self) -> Result<ServerStateSnapshot, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(RaftEvent::Snapshot(tx))
            .map_err(|_| RaftError::NotRunning)?;
        rx.await.map_err(|_| RaftError::NotRunning)
    }

    /// Leaves the group and stops the node's timers.
    pub async fn shutdown(self) -> Result<(), RaftError> {
        self.group.unregister(&self.id);
        self.events
            .send(RaftEvent::Shutdown)
            .map_err(|_| RaftError::NotRunning)?;
        self.task.await.map_err(|_| RaftError::NotRunning)?;
        info!("Node {} shut down", self.id);
        Ok(())
    }
}
