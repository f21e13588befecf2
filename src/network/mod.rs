use thiserror::Error;

use crate::raft::{NodeId, Rpc, RpcResult};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Node disconnected: {0}")]
    Disconnected(String),
}

/// Delivers requests and results between members of a group.
///
/// Sends are fire-and-forget: there is no retry, no ordering and no delivery
/// guarantee. The election protocol relies only on term comparison, so a
/// lost message is recovered by the next timeout or heartbeat.
pub trait Router: Send + Sync {
    /// Broadcasts `rpc` to every member other than its sender.
    fn send_rpc(&self, rpc: Rpc);

    /// Sends `result` back to the node that issued the request.
    fn send_result(&self, result: RpcResult, target: &NodeId);
}

pub mod group;

pub use group::{GroupRouter, ServerGroup};
