use std::collections::BTreeSet;
use std::fmt;

use ::log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::scheduler::{ElectionTimeout, LogReplicationTask, TimerId};
use super::{
    AppendEntriesResult, AppendEntriesRpc, NodeId, RequestVoteResult, RequestVoteRpc, Rpc,
    RpcResult, Term,
};
use crate::network::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time read of a node's state. Observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStateSnapshot {
    pub role: NodeRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
}

impl ServerStateSnapshot {
    /// A follower-to-follower change that only re-armed the timer. Not worth
    /// reporting.
    pub fn is_stable_after(&self, before: &ServerStateSnapshot) -> bool {
        before.role == NodeRole::Follower
            && self.role == before.role
            && self.term == before.term
            && self.leader_id == before.leader_id
            && self.voted_for == before.voted_for
    }
}

impl fmt::Display for ServerStateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} term={}", self.role, self.term)?;
        if let Some(leader) = &self.leader_id {
            write!(f, " leader={leader}")?;
        }
        if let Some(voted_for) = &self.voted_for {
            write!(f, " voted_for={voted_for}")?;
        }
        Ok(())
    }
}

/// What a state needs from the node that hosts it.
///
/// Every side effect of a transition goes through here, so the states
/// themselves never touch a timer or a socket.
pub trait ServerStateContext {
    fn self_id(&self) -> &NodeId;

    /// Size of the whole group, self included.
    fn server_count(&self) -> usize;

    /// Replaces the current state. The outgoing state must already have
    /// cancelled its timer or task.
    fn set_server_state(&mut self, state: ServerState);

    fn schedule_election_timeout(&mut self) -> ElectionTimeout;

    fn schedule_log_replication_task(&mut self) -> LogReplicationTask;

    fn router(&self) -> &dyn Router;
}

#[derive(Debug, Clone)]
pub struct FollowerState {
    term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    election_timeout: ElectionTimeout,
}

#[derive(Debug, Clone)]
pub struct CandidateState {
    term: Term,
    id: NodeId,
    // Granting voters, self included.
    votes: BTreeSet<NodeId>,
    election_timeout: ElectionTimeout,
}

#[derive(Debug, Clone)]
pub struct LeaderState {
    term: Term,
    id: NodeId,
    log_replication_task: LogReplicationTask,
}

/// The role a node is currently playing, with the data that role needs.
///
/// A state is never mutated: each handler decides on a replacement and
/// installs it through the context.
#[derive(Debug, Clone)]
pub enum ServerState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl ServerState {
    /// The state every node starts in: follower at term 0, no vote, no leader.
    pub fn initial(election_timeout: ElectionTimeout) -> Self {
        Self::follower(0, None, None, election_timeout)
    }

    pub fn follower(
        term: Term,
        voted_for: Option<NodeId>,
        leader_id: Option<NodeId>,
        election_timeout: ElectionTimeout,
    ) -> Self {
        ServerState::Follower(FollowerState {
            term,
            voted_for,
            leader_id,
            election_timeout,
        })
    }

    pub fn candidate(term: Term, id: NodeId, election_timeout: ElectionTimeout) -> Self {
        let votes = BTreeSet::from([id.clone()]);
        ServerState::Candidate(CandidateState {
            term,
            id,
            votes,
            election_timeout,
        })
    }

    pub fn leader(term: Term, id: NodeId, log_replication_task: LogReplicationTask) -> Self {
        ServerState::Leader(LeaderState {
            term,
            id,
            log_replication_task,
        })
    }

    pub fn role(&self) -> NodeRole {
        match self {
            ServerState::Follower(_) => NodeRole::Follower,
            ServerState::Candidate(_) => NodeRole::Candidate,
            ServerState::Leader(_) => NodeRole::Leader,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            ServerState::Follower(s) => s.term,
            ServerState::Candidate(s) => s.term,
            ServerState::Leader(s) => s.term,
        }
    }

    /// Granting votes collected so far; zero unless campaigning.
    pub fn votes_received(&self) -> usize {
        match self {
            ServerState::Candidate(s) => s.votes.len(),
            _ => 0,
        }
    }

    pub fn take_snapshot(&self) -> ServerStateSnapshot {
        match self {
            ServerState::Follower(s) => ServerStateSnapshot {
                role: NodeRole::Follower,
                term: s.term,
                leader_id: s.leader_id.clone(),
                voted_for: s.voted_for.clone(),
            },
            ServerState::Candidate(s) => ServerStateSnapshot {
                role: NodeRole::Candidate,
                term: s.term,
                leader_id: None,
                voted_for: Some(s.id.clone()),
            },
            ServerState::Leader(s) => ServerStateSnapshot {
                role: NodeRole::Leader,
                term: s.term,
                leader_id: Some(s.id.clone()),
                voted_for: Some(s.id.clone()),
            },
        }
    }

    /// Id of the live election timeout, if this state has one.
    pub fn election_timeout_id(&self) -> Option<TimerId> {
        match self {
            ServerState::Follower(s) => Some(s.election_timeout.id()),
            ServerState::Candidate(s) => Some(s.election_timeout.id()),
            ServerState::Leader(_) => None,
        }
    }

    /// Id of the live heartbeat task, if this state has one.
    pub fn log_replication_task_id(&self) -> Option<TimerId> {
        match self {
            ServerState::Leader(s) => Some(s.log_replication_task.id()),
            _ => None,
        }
    }

    pub fn cancel_timeout_or_task(&self) {
        match self {
            ServerState::Follower(s) => s.election_timeout.cancel(),
            ServerState::Candidate(s) => s.election_timeout.cancel(),
            ServerState::Leader(s) => s.log_replication_task.cancel(),
        }
    }

    /// Starts an election, or restarts it after a split vote.
    pub fn on_election_timeout<C: ServerStateContext>(&self, ctx: &mut C) {
        if self.role() == NodeRole::Leader {
            warn!(
                "Node {}, election timeout while leader of term {}, ignore",
                ctx.self_id(),
                self.term()
            );
            return;
        }

        let new_term = match self.term().checked_add(1) {
            Some(term) => term,
            None => {
                warn!(
                    "Node {}, election timeout at term {}, no term left to campaign in, ignore",
                    ctx.self_id(),
                    self.term()
                );
                return;
            }
        };
        self.cancel_timeout_or_task();

        if ctx.server_count() <= 1 {
            // Our own vote is already a majority.
            Self::become_leader(ctx, new_term);
            return;
        }

        let election_timeout = ctx.schedule_election_timeout();
        let self_id = ctx.self_id().clone();
        ctx.set_server_state(Self::candidate(new_term, self_id.clone(), election_timeout));

        ctx.router().send_rpc(Rpc::RequestVote(RequestVoteRpc {
            term: new_term,
            candidate_id: self_id,
        }));
    }

    pub fn on_receive_request_vote_rpc<C: ServerStateContext>(&self, ctx: &mut C, rpc: &RequestVoteRpc) {
        let result = if rpc.term < self.term() {
            RequestVoteResult {
                term: self.term(),
                vote_granted: false,
            }
        } else if rpc.term == self.term() {
            self.process_request_vote_rpc(ctx, rpc)
        } else {
            debug!(
                "Node {}, update to peer {}'s term {} and vote for it",
                ctx.self_id(),
                rpc.candidate_id,
                rpc.term
            );
            self.cancel_timeout_or_task();
            let election_timeout = ctx.schedule_election_timeout();
            ctx.set_server_state(Self::follower(
                rpc.term,
                Some(rpc.candidate_id.clone()),
                None,
                election_timeout,
            ));
            RequestVoteResult {
                term: rpc.term,
                vote_granted: true,
            }
        };

        ctx.router()
            .send_result(RpcResult::RequestVote(result), &rpc.candidate_id);
    }

    fn process_request_vote_rpc<C: ServerStateContext>(
        &self,
        ctx: &mut C,
        rpc: &RequestVoteRpc,
    ) -> RequestVoteResult {
        let follower = match self {
            ServerState::Follower(s) => s,
            // Candidates and leaders already voted for themselves.
            ServerState::Candidate(_) | ServerState::Leader(_) => {
                return RequestVoteResult {
                    term: self.term(),
                    vote_granted: false,
                };
            }
        };

        let vote_granted = match &follower.voted_for {
            None => true,
            Some(voted_for) => *voted_for == rpc.candidate_id,
        };

        if vote_granted {
            debug!(
                "Node {}, vote for {} in term {}",
                ctx.self_id(),
                rpc.candidate_id,
                follower.term
            );
            self.cancel_timeout_or_task();
            let election_timeout = ctx.schedule_election_timeout();
            ctx.set_server_state(Self::follower(
                follower.term,
                Some(rpc.candidate_id.clone()),
                follower.leader_id.clone(),
                election_timeout,
            ));
        }

        RequestVoteResult {
            term: follower.term,
            vote_granted,
        }
    }

    pub fn on_receive_request_vote_result<C: ServerStateContext>(
        &self,
        ctx: &mut C,
        result: RequestVoteResult,
        from: &NodeId,
    ) {
        let candidate = match self {
            ServerState::Candidate(s) => s,
            // Late result from an election this node no longer runs.
            ServerState::Follower(_) | ServerState::Leader(_) => {
                debug!("Node {}, ignore vote result from {from}", ctx.self_id());
                return;
            }
        };

        if result.term > candidate.term {
            debug!(
                "Node {}, peer {from} reports higher term {}, step down",
                ctx.self_id(),
                result.term
            );
            self.step_down(ctx, result.term);
            return;
        }
        if result.term < candidate.term || !result.vote_granted {
            return;
        }
        if candidate.votes.contains(from) {
            return;
        }

        let mut votes = candidate.votes.clone();
        votes.insert(from.clone());
        debug!(
            "Node {}, {} of {} votes in term {}",
            ctx.self_id(),
            votes.len(),
            ctx.server_count(),
            candidate.term
        );

        if votes.len() * 2 > ctx.server_count() {
            self.cancel_timeout_or_task();
            Self::become_leader(ctx, candidate.term);
        } else {
            ctx.set_server_state(ServerState::Candidate(CandidateState {
                term: candidate.term,
                id: candidate.id.clone(),
                votes,
                election_timeout: candidate.election_timeout.clone(),
            }));
        }
    }

    pub fn on_receive_append_entries_rpc<C: ServerStateContext>(
        &self,
        ctx: &mut C,
        rpc: &AppendEntriesRpc,
    ) {
        let result = if rpc.term < self.term() {
            AppendEntriesResult {
                term: self.term(),
                success: false,
            }
        } else if rpc.term == self.term() {
            self.process_append_entries_rpc(ctx, rpc)
        } else {
            self.cancel_timeout_or_task();
            let election_timeout = ctx.schedule_election_timeout();
            ctx.set_server_state(Self::follower(
                rpc.term,
                None,
                Some(rpc.leader_id.clone()),
                election_timeout,
            ));
            AppendEntriesResult {
                term: rpc.term,
                success: true,
            }
        };

        ctx.router()
            .send_result(RpcResult::AppendEntries(result), &rpc.leader_id);
    }

    fn process_append_entries_rpc<C: ServerStateContext>(
        &self,
        ctx: &mut C,
        rpc: &AppendEntriesRpc,
    ) -> AppendEntriesResult {
        let voted_for = match self {
            ServerState::Follower(s) => s.voted_for.clone(),
            // A candidate keeps the vote it gave itself for this term.
            ServerState::Candidate(s) => Some(s.id.clone()),
            ServerState::Leader(_) => {
                warn!(
                    "Node {}, another leader {} in term {}",
                    ctx.self_id(),
                    rpc.leader_id,
                    rpc.term
                );
                return AppendEntriesResult {
                    term: self.term(),
                    success: false,
                };
            }
        };

        self.cancel_timeout_or_task();
        let election_timeout = ctx.schedule_election_timeout();
        ctx.set_server_state(Self::follower(
            rpc.term,
            voted_for,
            Some(rpc.leader_id.clone()),
            election_timeout,
        ));
        AppendEntriesResult {
            term: rpc.term,
            success: true,
        }
    }

    /// Heartbeat results carry no log progress; only a newer term matters.
    pub fn on_receive_append_entries_result<C: ServerStateContext>(
        &self,
        ctx: &mut C,
        result: AppendEntriesResult,
        from: &NodeId,
    ) {
        if result.term > self.term() {
            debug!(
                "Node {}, peer {from} reports higher term {}, step down",
                ctx.self_id(),
                result.term
            );
            self.step_down(ctx, result.term);
        }
    }

    /// Fired by the heartbeat task.
    pub fn on_replicate_log<C: ServerStateContext>(&self, ctx: &mut C) {
        let leader = match self {
            ServerState::Leader(s) => s,
            _ => return,
        };
        ctx.router().send_rpc(Rpc::AppendEntries(AppendEntriesRpc {
            term: leader.term,
            leader_id: leader.id.clone(),
        }));
    }

    fn step_down<C: ServerStateContext>(&self, ctx: &mut C, term: Term) {
        self.cancel_timeout_or_task();
        let election_timeout = ctx.schedule_election_timeout();
        ctx.set_server_state(Self::follower(term, None, None, election_timeout));
    }

    fn become_leader<C: ServerStateContext>(ctx: &mut C, term: Term) {
        let self_id = ctx.self_id().clone();
        let task = ctx.schedule_log_replication_task();
        ctx.set_server_state(Self::leader(term, self_id.clone(), task));

        ctx.router().send_rpc(Rpc::AppendEntries(AppendEntriesRpc {
            term,
            leader_id: self_id,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::scheduler::TimerHandle;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRouter {
        rpcs: Mutex<Vec<Rpc>>,
        results: Mutex<Vec<(RpcResult, NodeId)>>,
    }

    impl Router for RecordingRouter {
        fn send_rpc(&self, rpc: Rpc) {
            self.rpcs.lock().unwrap().push(rpc);
        }

        fn send_result(&self, result: RpcResult, target: &NodeId) {
            self.results.lock().unwrap().push((result, target.clone()));
        }
    }

    struct TestContext {
        id: NodeId,
        server_count: usize,
        installed: Option<ServerState>,
        next_timer: TimerId,
        election_timeouts: usize,
        replication_tasks: usize,
        router: RecordingRouter,
    }

    impl TestContext {
        fn new(id: &str, server_count: usize) -> Self {
            Self {
                id: NodeId::from(id),
                server_count,
                installed: None,
                next_timer: 100,
                election_timeouts: 0,
                replication_tasks: 0,
                router: RecordingRouter::default(),
            }
        }

        fn take_state(&mut self) -> Option<ServerState> {
            self.installed.take()
        }

        fn rpcs(&self) -> Vec<Rpc> {
            self.router.rpcs.lock().unwrap().clone()
        }

        fn results(&self) -> Vec<(RpcResult, NodeId)> {
            self.router.results.lock().unwrap().clone()
        }
    }

    impl ServerStateContext for TestContext {
        fn self_id(&self) -> &NodeId {
            &self.id
        }

        fn server_count(&self) -> usize {
            self.server_count
        }

        fn set_server_state(&mut self, state: ServerState) {
            self.installed = Some(state);
        }

        fn schedule_election_timeout(&mut self) -> ElectionTimeout {
            self.next_timer += 1;
            self.election_timeouts += 1;
            ElectionTimeout::new(TimerHandle::detached(self.next_timer))
        }

        fn schedule_log_replication_task(&mut self) -> LogReplicationTask {
            self.next_timer += 1;
            self.replication_tasks += 1;
            LogReplicationTask::new(TimerHandle::detached(self.next_timer))
        }

        fn router(&self) -> &dyn Router {
            &self.router
        }
    }

    fn timeout(id: TimerId) -> ElectionTimeout {
        ElectionTimeout::new(TimerHandle::detached(id))
    }

    fn follower(term: Term, voted_for: Option<&str>, leader: Option<&str>) -> ServerState {
        ServerState::follower(term, voted_for.map(NodeId::from), leader.map(NodeId::from), timeout(1))
    }

    fn candidate(term: Term, id: &str) -> ServerState {
        ServerState::candidate(term, NodeId::from(id), timeout(1))
    }

    fn leader(term: Term, id: &str) -> ServerState {
        ServerState::leader(term, NodeId::from(id), LogReplicationTask::new(TimerHandle::detached(1)))
    }

    fn vote_rpc(term: Term, candidate: &str) -> RequestVoteRpc {
        RequestVoteRpc {
            term,
            candidate_id: NodeId::from(candidate),
        }
    }

    fn heartbeat(term: Term, leader: &str) -> AppendEntriesRpc {
        AppendEntriesRpc {
            term,
            leader_id: NodeId::from(leader),
        }
    }

    fn granted(term: Term) -> RequestVoteResult {
        RequestVoteResult {
            term,
            vote_granted: true,
        }
    }

    #[test]
    fn initial_state_is_follower_at_term_zero() {
        let state = ServerState::initial(timeout(7));
        assert_eq!(
            state.take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Follower,
                term: 0,
                leader_id: None,
                voted_for: None,
            }
        );
        assert_eq!(state.election_timeout_id(), Some(7));
        assert_eq!(state.log_replication_task_id(), None);
    }

    #[test]
    fn follower_election_timeout_starts_campaign() {
        let mut ctx = TestContext::new("a", 3);
        follower(4, Some("b"), Some("b")).on_election_timeout(&mut ctx);

        let next = ctx.take_state().expect("new state");
        let snapshot = next.take_snapshot();
        assert_eq!(snapshot.role, NodeRole::Candidate);
        assert_eq!(snapshot.term, 5);
        assert_eq!(snapshot.voted_for, Some(NodeId::from("a")));
        assert_eq!(snapshot.leader_id, None);
        assert_eq!(next.votes_received(), 1);
        assert_eq!(ctx.election_timeouts, 1);
        assert_eq!(ctx.rpcs(), vec![Rpc::RequestVote(vote_rpc(5, "a"))]);
    }

    #[test]
    fn candidate_election_timeout_restarts_with_next_term() {
        let mut ctx = TestContext::new("a", 3);
        candidate(5, "a").on_election_timeout(&mut ctx);

        let next = ctx.take_state().expect("new state");
        assert_eq!(next.role(), NodeRole::Candidate);
        assert_eq!(next.term(), 6);
        assert_eq!(next.votes_received(), 1);
        assert_eq!(ctx.rpcs(), vec![Rpc::RequestVote(vote_rpc(6, "a"))]);
    }

    #[test]
    fn leader_ignores_election_timeout() {
        let mut ctx = TestContext::new("a", 3);
        leader(2, "a").on_election_timeout(&mut ctx);

        assert!(ctx.take_state().is_none());
        assert!(ctx.rpcs().is_empty());
        assert_eq!(ctx.election_timeouts, 0);
    }

    #[test]
    fn single_server_group_elects_itself_on_timeout() {
        let mut ctx = TestContext::new("solo", 1);
        follower(0, None, None).on_election_timeout(&mut ctx);

        let next = ctx.take_state().expect("new state");
        assert_eq!(next.role(), NodeRole::Leader);
        assert_eq!(next.term(), 1);
        assert_eq!(ctx.replication_tasks, 1);
        assert_eq!(ctx.election_timeouts, 0);
    }

    #[test]
    fn stale_request_vote_is_refused_without_state_change() {
        let mut ctx = TestContext::new("b", 3);
        follower(3, None, None).on_receive_request_vote_rpc(&mut ctx, &vote_rpc(2, "a"));

        assert!(ctx.take_state().is_none());
        assert_eq!(
            ctx.results(),
            vec![(
                RpcResult::RequestVote(RequestVoteResult {
                    term: 3,
                    vote_granted: false
                }),
                NodeId::from("a")
            )]
        );
    }

    #[test]
    fn follower_grants_one_vote_per_term() {
        let mut ctx = TestContext::new("c", 3);
        follower(1, None, None).on_receive_request_vote_rpc(&mut ctx, &vote_rpc(1, "a"));
        let voted = ctx.take_state().expect("vote recorded");
        assert_eq!(voted.take_snapshot().voted_for, Some(NodeId::from("a")));

        voted.on_receive_request_vote_rpc(&mut ctx, &vote_rpc(1, "b"));
        assert!(ctx.take_state().is_none());

        // A repeated request from the same candidate is granted again.
        voted.on_receive_request_vote_rpc(&mut ctx, &vote_rpc(1, "a"));
        let again = ctx.take_state().expect("vote re-recorded");
        assert_eq!(again.take_snapshot().voted_for, Some(NodeId::from("a")));

        let grants: Vec<bool> = ctx
            .results()
            .into_iter()
            .map(|(result, _)| match result {
                RpcResult::RequestVote(r) => r.vote_granted,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(grants, vec![true, false, true]);
    }

    #[test]
    fn candidate_and_leader_refuse_same_term_votes() {
        for state in [candidate(1, "b"), leader(1, "b")] {
            let mut ctx = TestContext::new("b", 3);
            state.on_receive_request_vote_rpc(&mut ctx, &vote_rpc(1, "c"));
            assert!(ctx.take_state().is_none());
            assert_eq!(
                ctx.results()[0].0,
                RpcResult::RequestVote(RequestVoteResult {
                    term: 1,
                    vote_granted: false
                })
            );
        }
    }

    #[test]
    fn higher_term_request_vote_converts_any_role_to_voting_follower() {
        for state in [follower(1, Some("x"), Some("x")), candidate(1, "b"), leader(1, "b")] {
            let mut ctx = TestContext::new("b", 3);
            state.on_receive_request_vote_rpc(&mut ctx, &vote_rpc(4, "c"));

            let next = ctx.take_state().expect("stepped down");
            assert_eq!(
                next.take_snapshot(),
                ServerStateSnapshot {
                    role: NodeRole::Follower,
                    term: 4,
                    leader_id: None,
                    voted_for: Some(NodeId::from("c")),
                }
            );
            assert_eq!(ctx.election_timeouts, 1);
            assert_eq!(
                ctx.results(),
                vec![(RpcResult::RequestVote(granted(4)), NodeId::from("c"))]
            );
        }
    }

    #[test]
    fn candidate_becomes_leader_on_majority() {
        let mut ctx = TestContext::new("a", 3);
        candidate(1, "a").on_receive_request_vote_result(&mut ctx, granted(1), &NodeId::from("b"));

        let next = ctx.take_state().expect("elected");
        assert_eq!(
            next.take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Leader,
                term: 1,
                leader_id: Some(NodeId::from("a")),
                voted_for: Some(NodeId::from("a")),
            }
        );
        assert_eq!(ctx.replication_tasks, 1);
        assert_eq!(ctx.rpcs(), vec![Rpc::AppendEntries(heartbeat(1, "a"))]);
    }

    #[test]
    fn candidate_needs_strict_majority_in_even_groups() {
        let mut ctx = TestContext::new("a", 4);
        candidate(2, "a").on_receive_request_vote_result(&mut ctx, granted(2), &NodeId::from("b"));
        let two_votes = ctx.take_state().expect("vote counted");
        assert_eq!(two_votes.role(), NodeRole::Candidate);
        assert_eq!(two_votes.votes_received(), 2);
        // The election timer carries over while votes accumulate.
        assert_eq!(two_votes.election_timeout_id(), Some(1));

        // The same voter again does not count twice.
        two_votes.on_receive_request_vote_result(&mut ctx, granted(2), &NodeId::from("b"));
        assert!(ctx.take_state().is_none());

        two_votes.on_receive_request_vote_result(&mut ctx, granted(2), &NodeId::from("c"));
        assert_eq!(ctx.take_state().expect("elected").role(), NodeRole::Leader);
    }

    #[test]
    fn candidate_ignores_stale_and_negative_results() {
        let mut ctx = TestContext::new("a", 3);
        let state = candidate(3, "a");
        state.on_receive_request_vote_result(&mut ctx, granted(2), &NodeId::from("b"));
        state.on_receive_request_vote_result(
            &mut ctx,
            RequestVoteResult {
                term: 3,
                vote_granted: false,
            },
            &NodeId::from("c"),
        );
        assert!(ctx.take_state().is_none());
        assert!(ctx.rpcs().is_empty());
    }

    #[test]
    fn higher_term_vote_result_steps_candidate_down() {
        let mut ctx = TestContext::new("a", 3);
        candidate(3, "a").on_receive_request_vote_result(
            &mut ctx,
            RequestVoteResult {
                term: 5,
                vote_granted: false,
            },
            &NodeId::from("b"),
        );
        assert_eq!(
            ctx.take_state().expect("stepped down").take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Follower,
                term: 5,
                leader_id: None,
                voted_for: None,
            }
        );
    }

    #[test]
    fn follower_and_leader_ignore_vote_results_of_any_term() {
        let newer = RequestVoteResult {
            term: 5,
            vote_granted: false,
        };
        for state in [follower(2, None, None), leader(2, "a")] {
            for result in [granted(2), newer] {
                let mut ctx = TestContext::new("a", 3);
                state.on_receive_request_vote_result(&mut ctx, result, &NodeId::from("b"));
                assert!(ctx.take_state().is_none());
                assert_eq!(ctx.election_timeouts, 0);
            }
        }
    }

    #[test]
    fn election_timeout_at_last_term_keeps_state() {
        let mut ctx = TestContext::new("a", 3);
        let state = follower(0, None, None);
        state.on_receive_request_vote_rpc(&mut ctx, &vote_rpc(Term::MAX, "b"));
        let state = ctx.take_state().expect("adopts the newer term");
        assert_eq!(state.term(), Term::MAX);

        for stuck in [state, candidate(Term::MAX, "a")] {
            let mut ctx = TestContext::new("a", 3);
            stuck.on_election_timeout(&mut ctx);
            assert!(ctx.take_state().is_none());
            assert!(ctx.rpcs().is_empty());
            assert_eq!(ctx.election_timeouts, 0);
        }
    }

    #[test]
    fn stale_append_entries_is_rejected() {
        let mut ctx = TestContext::new("b", 3);
        leader(5, "b").on_receive_append_entries_rpc(&mut ctx, &heartbeat(4, "a"));
        assert!(ctx.take_state().is_none());
        assert_eq!(
            ctx.results(),
            vec![(
                RpcResult::AppendEntries(AppendEntriesResult {
                    term: 5,
                    success: false
                }),
                NodeId::from("a")
            )]
        );
    }

    #[test]
    fn follower_heartbeat_resets_timer_and_records_leader() {
        let mut ctx = TestContext::new("b", 3);
        follower(1, Some("a"), None).on_receive_append_entries_rpc(&mut ctx, &heartbeat(1, "a"));

        let next = ctx.take_state().expect("timer reset");
        assert_eq!(next.election_timeout_id(), Some(101));
        assert_eq!(
            next.take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Follower,
                term: 1,
                leader_id: Some(NodeId::from("a")),
                voted_for: Some(NodeId::from("a")),
            }
        );
        assert_eq!(
            ctx.results()[0].0,
            RpcResult::AppendEntries(AppendEntriesResult {
                term: 1,
                success: true
            })
        );
    }

    #[test]
    fn candidate_yields_to_same_term_leader_keeping_its_vote() {
        let mut ctx = TestContext::new("b", 3);
        candidate(1, "b").on_receive_append_entries_rpc(&mut ctx, &heartbeat(1, "a"));

        assert_eq!(
            ctx.take_state().expect("stepped down").take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Follower,
                term: 1,
                leader_id: Some(NodeId::from("a")),
                voted_for: Some(NodeId::from("b")),
            }
        );
    }

    #[test]
    fn leader_rejects_same_term_append_entries() {
        let mut ctx = TestContext::new("b", 3);
        leader(2, "b").on_receive_append_entries_rpc(&mut ctx, &heartbeat(2, "a"));
        assert!(ctx.take_state().is_none());
        assert_eq!(
            ctx.results()[0].0,
            RpcResult::AppendEntries(AppendEntriesResult {
                term: 2,
                success: false
            })
        );
    }

    #[test]
    fn leader_steps_down_to_newer_leader() {
        let mut ctx = TestContext::new("a", 3);
        leader(2, "a").on_receive_append_entries_rpc(&mut ctx, &heartbeat(3, "x"));

        let next = ctx.take_state().expect("stepped down");
        assert_eq!(
            next.take_snapshot(),
            ServerStateSnapshot {
                role: NodeRole::Follower,
                term: 3,
                leader_id: Some(NodeId::from("x")),
                voted_for: None,
            }
        );
        assert!(next.election_timeout_id().is_some());
        assert_eq!(ctx.election_timeouts, 1);
        assert_eq!(
            ctx.results(),
            vec![(
                RpcResult::AppendEntries(AppendEntriesResult {
                    term: 3,
                    success: true
                }),
                NodeId::from("x")
            )]
        );
    }

    #[test]
    fn higher_term_append_entries_result_deposes_leader() {
        let mut ctx = TestContext::new("a", 3);
        let state = leader(2, "a");
        state.on_receive_append_entries_result(
            &mut ctx,
            AppendEntriesResult {
                term: 2,
                success: true,
            },
            &NodeId::from("b"),
        );
        assert!(ctx.take_state().is_none());

        state.on_receive_append_entries_result(
            &mut ctx,
            AppendEntriesResult {
                term: 7,
                success: false,
            },
            &NodeId::from("b"),
        );
        let next = ctx.take_state().expect("stepped down");
        assert_eq!(next.role(), NodeRole::Follower);
        assert_eq!(next.term(), 7);
    }

    #[test]
    fn only_leader_sends_heartbeats() {
        let mut ctx = TestContext::new("a", 3);
        follower(1, None, None).on_replicate_log(&mut ctx);
        candidate(1, "a").on_replicate_log(&mut ctx);
        assert!(ctx.rpcs().is_empty());

        leader(4, "a").on_replicate_log(&mut ctx);
        assert_eq!(ctx.rpcs(), vec![Rpc::AppendEntries(heartbeat(4, "a"))]);
    }

    #[test]
    fn stability_only_covers_unchanged_followers() {
        let before = follower(1, None, Some("a")).take_snapshot();
        assert!(follower(1, None, Some("a")).take_snapshot().is_stable_after(&before));
        assert!(!follower(2, None, Some("a")).take_snapshot().is_stable_after(&before));
        assert!(!follower(1, Some("a"), Some("a")).take_snapshot().is_stable_after(&before));

        let c = candidate(1, "a").take_snapshot();
        assert!(!candidate(1, "a").take_snapshot().is_stable_after(&c));
    }

    #[test]
    fn snapshot_display_is_compact() {
        let s = leader(3, "a").take_snapshot();
        assert_eq!(s.to_string(), "leader term=3 leader=a voted_for=a");
        let f = follower(0, None, None).take_snapshot();
        assert_eq!(f.to_string(), "follower term=0");
    }
}
