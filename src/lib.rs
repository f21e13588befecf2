pub mod cluster;
pub mod config;
pub mod network;
pub mod raft;

// Public exports
pub use cluster::LocalCluster;
pub use config::ClusterConfig;
pub use network::{Router, ServerGroup};
pub use raft::{NodeId, NodeRole, Raft, RaftConfig, RaftError, ServerStateSnapshot};
