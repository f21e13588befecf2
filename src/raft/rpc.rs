use std::fmt;

use serde::{Deserialize, Serialize};

/// A leader term number. Increases monotonically.
pub type Term = u64;

/// Identity of a server in the group. Unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRpc {
    pub term: Term,
    pub candidate_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: Term,
    pub vote_granted: bool,
}

/// Leader heartbeat. Carries no log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRpc {
    pub term: Term,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: Term,
    pub success: bool,
}

/// Requests broadcast by a node to all of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rpc {
    RequestVote(RequestVoteRpc),
    AppendEntries(AppendEntriesRpc),
}

impl Rpc {
    pub fn term(&self) -> Term {
        match self {
            Rpc::RequestVote(rpc) => rpc.term,
            Rpc::AppendEntries(rpc) => rpc.term,
        }
    }

    /// The node that issued this request.
    pub fn sender(&self) -> &NodeId {
        match self {
            Rpc::RequestVote(rpc) => &rpc.candidate_id,
            Rpc::AppendEntries(rpc) => &rpc.leader_id,
        }
    }
}

/// Replies sent back to the node that issued an [`Rpc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResult {
    RequestVote(RequestVoteResult),
    AppendEntries(AppendEntriesResult),
}

impl RpcResult {
    pub fn term(&self) -> Term {
        match self {
            RpcResult::RequestVote(result) => result.term,
            RpcResult::AppendEntries(result) => result.term,
        }
    }
}

// Message types for Raft communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    Rpc(Rpc),
    Result(RpcResult),
}

impl From<Rpc> for RaftMessage {
    fn from(rpc: Rpc) -> Self {
        RaftMessage::Rpc(rpc)
    }
}

impl From<RpcResult> for RaftMessage {
    fn from(result: RpcResult) -> Self {
        RaftMessage::Result(result)
    }
}

/// A message in flight between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: RaftMessage,
}
