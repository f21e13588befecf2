use tokio::sync::{mpsc, oneshot, watch};
use ::log::{debug, error, info};

use super::scheduler::{ElectionTimeout, LogReplicationTask, Scheduler, TimerId};
use super::state::{NodeRole, ServerState, ServerStateContext, ServerStateSnapshot};
use super::store::ServerStore;
use super::{Envelope, NodeId, RaftConfig, RaftMessage, Rpc, RpcResult};
use crate::network::Router;

/// Everything a node reacts to, funnelled through one inbox.
#[derive(Debug)]
pub enum RaftEvent {
    ElectionTimeout(TimerId),
    ReplicateLog(TimerId),
    Message(Envelope),
    Snapshot(oneshot::Sender<ServerStateSnapshot>),
    Shutdown,
}

struct NodeContext {
    id: NodeId,
    server_count: usize,
    scheduler: Scheduler,
    store: ServerStore,
    router: Box<dyn Router>,
    // Timer callbacks post back into the node's own inbox.
    events: mpsc::UnboundedSender<RaftEvent>,
    replacement: Option<ServerState>,
}

impl ServerStateContext for NodeContext {
    fn self_id(&self) -> &NodeId {
        &self.id
    }

    fn server_count(&self) -> usize {
        self.server_count
    }

    fn set_server_state(&mut self, state: ServerState) {
        let snapshot = state.take_snapshot();
        match self.store.save(snapshot.term, snapshot.voted_for) {
            Ok(true) => debug!(
                "Node {}, persisted term {} and vote {:?}",
                self.id,
                self.store.term(),
                self.store.voted_for()
            ),
            Ok(false) => {}
            Err(e) => error!("Node {}, failed to persist term and vote: {e}", self.id),
        }
        self.replacement = Some(state);
    }

    fn schedule_election_timeout(&mut self) -> ElectionTimeout {
        let events = self.events.clone();
        self.scheduler.schedule_election_timeout(move |id| {
            let _ = events.send(RaftEvent::ElectionTimeout(id));
        })
    }

    fn schedule_log_replication_task(&mut self) -> LogReplicationTask {
        let events = self.events.clone();
        self.scheduler.schedule_log_replication_task(move |id| {
            let _ = events.send(RaftEvent::ReplicateLog(id));
        })
    }

    fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }
}

/// The driving loop of one node.
///
/// Owns the only copy of the node's state and handles one event at a time,
/// so no handler ever races another on the same node.
pub struct RaftNode {
    context: NodeContext,
    inbox: mpsc::UnboundedReceiver<RaftEvent>,
    state_tx: watch::Sender<ServerStateSnapshot>,
    last_reported: Option<ServerStateSnapshot>,
}

impl RaftNode {
    /// `events` must be the sending half of `inbox`. The node resumes from
    /// the term and vote held by `store`.
    pub fn new(
        config: &RaftConfig,
        store: ServerStore,
        router: Box<dyn Router>,
        events: mpsc::UnboundedSender<RaftEvent>,
        inbox: mpsc::UnboundedReceiver<RaftEvent>,
    ) -> (Self, watch::Receiver<ServerStateSnapshot>) {
        let scheduler = Scheduler::new(
            config.node_id.clone(),
            config.election_timeout_min,
            config.election_timeout_max,
            config.heartbeat_interval,
        );
        let (state_tx, state_rx) = watch::channel(ServerStateSnapshot {
            role: NodeRole::Follower,
            term: store.term(),
            leader_id: None,
            voted_for: store.voted_for().cloned(),
        });

        let node = Self {
            context: NodeContext {
                id: config.node_id.clone(),
                server_count: config.server_count(),
                scheduler,
                store,
                router,
                events,
                replacement: None,
            },
            inbox,
            state_tx,
            last_reported: None,
        };
        (node, state_rx)
    }

    pub fn id(&self) -> &NodeId {
        &self.context.id
    }

    /// Runs until a `Shutdown` event arrives or every sender is gone. Must be
    /// spawned on a tokio runtime.
    pub async fn run(mut self) {
        let election_timeout = self.context.schedule_election_timeout();
        let mut state = ServerState::follower(
            self.context.store.term(),
            self.context.store.voted_for().cloned(),
            None,
            election_timeout,
        );
        debug!("Node {}, start with state {}", self.context.id, state.take_snapshot());
        self.state_changed(&state);

        while let Some(event) = self.inbox.recv().await {
            match event {
                RaftEvent::Shutdown => break,
                RaftEvent::Snapshot(reply) => {
                    let _ = reply.send(state.take_snapshot());
                    continue;
                }
                event => self.handle_event(&state, event),
            }

            if let Some(next) = self.context.replacement.take() {
                debug!(
                    "Node {}, state changed {} -> {}",
                    self.context.id,
                    state.take_snapshot(),
                    next.take_snapshot()
                );
                state = next;
                self.state_changed(&state);
            }
        }

        state.cancel_timeout_or_task();
        self.context.scheduler.stop();
        debug!("Node {}, stopped", self.context.id);
    }

    fn handle_event(&mut self, state: &ServerState, event: RaftEvent) {
        let ctx = &mut self.context;
        match event {
            RaftEvent::ElectionTimeout(id) => {
                // A timeout that fired just before its state was replaced is
                // still in the inbox; it belongs to nobody now.
                if state.election_timeout_id() != Some(id) {
                    debug!("Node {}, drop stale election timeout {id}", ctx.id);
                    return;
                }
                debug!("Node {}, election timeout", ctx.id);
                state.on_election_timeout(ctx);
            }
            RaftEvent::ReplicateLog(id) => {
                if state.log_replication_task_id() != Some(id) {
                    debug!("Node {}, drop stale replication tick {id}", ctx.id);
                    return;
                }
                debug!("Node {}, replicate log", ctx.id);
                state.on_replicate_log(ctx);
            }
            RaftEvent::Message(Envelope { from, message }) => {
                debug!("Node {}, receive {message:?} from {from}", ctx.id);
                match message {
                    RaftMessage::Rpc(Rpc::RequestVote(rpc)) => {
                        state.on_receive_request_vote_rpc(ctx, &rpc)
                    }
                    RaftMessage::Rpc(Rpc::AppendEntries(rpc)) => {
                        state.on_receive_append_entries_rpc(ctx, &rpc)
                    }
                    RaftMessage::Result(RpcResult::RequestVote(result)) => {
                        state.on_receive_request_vote_result(ctx, result, &from)
                    }
                    RaftMessage::Result(RpcResult::AppendEntries(result)) => {
                        state.on_receive_append_entries_result(ctx, result, &from)
                    }
                }
            }
            RaftEvent::Snapshot(_) | RaftEvent::Shutdown => {}
        }
    }

    fn state_changed(&mut self, state: &ServerState) {
        let snapshot = state.take_snapshot();
        let stable = self
            .last_reported
            .as_ref()
            .is_some_and(|before| snapshot.is_stable_after(before));
        if stable {
            return;
        }

        info!("Node {}, state changed -> {}", self.context.id, snapshot);
        self.last_reported = Some(snapshot.clone());
        self.state_tx.send_replace(snapshot);
    }
}
