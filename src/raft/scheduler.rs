use std::collections::HashMap;
use std::time::Duration;

use ::log::debug;
use rand::Rng;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use super::NodeId;

/// Identifies one armed timer. Passed to the timer's callback so the owner
/// can tell a current firing from a stale one.
pub type TimerId = u64;

/// Handle to a scheduled timer. Cancelling it is idempotent.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// A handle with no running timer behind it. Lets the state machine be
    /// driven by hand, without a runtime.
    pub fn detached(id: TimerId) -> Self {
        Self { id, abort: None }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// One-shot election timeout.
#[derive(Debug, Clone)]
pub struct ElectionTimeout(TimerHandle);

impl ElectionTimeout {
    pub fn new(handle: TimerHandle) -> Self {
        Self(handle)
    }

    pub fn id(&self) -> TimerId {
        self.0.id()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Repeating heartbeat / log replication task.
#[derive(Debug, Clone)]
pub struct LogReplicationTask(TimerHandle);

impl LogReplicationTask {
    pub fn new(handle: TimerHandle) -> Self {
        Self(handle)
    }

    pub fn id(&self) -> TimerId {
        self.0.id()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Per-node timers, backed by tokio tasks. Must be used from within a tokio
/// runtime.
pub struct Scheduler {
    node_id: NodeId,
    election_timeout_min: u64,
    election_timeout_max: u64,
    heartbeat_interval: Duration,
    next_id: TimerId,
    outstanding: HashMap<TimerId, AbortHandle>,
}

impl Scheduler {
    pub fn new(
        node_id: NodeId,
        election_timeout_min: u64,
        election_timeout_max: u64,
        heartbeat_interval: u64,
    ) -> Self {
        Self {
            node_id,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval: Duration::from_millis(heartbeat_interval),
            next_id: 1,
            outstanding: HashMap::new(),
        }
    }

    pub fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms = rng.random_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    /// Arms a one-shot timer with a randomized delay. The callback runs at
    /// most once.
    pub fn schedule_election_timeout<F>(&mut self, callback: F) -> ElectionTimeout
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let id = self.allocate_id();
        let delay = self.random_election_timeout();
        debug!("Node {}, schedule election timeout {id} in {delay:?}", self.node_id);

        let task = tokio::spawn(async move {
            sleep(delay).await;
            callback(id);
        });
        ElectionTimeout::new(self.track(id, task.abort_handle()))
    }

    /// Arms a repeating timer. The first tick happens one heartbeat interval
    /// from now, then once per interval until cancelled.
    pub fn schedule_log_replication_task<F>(&mut self, callback: F) -> LogReplicationTask
    where
        F: Fn(TimerId) + Send + 'static,
    {
        let id = self.allocate_id();
        let period = self.heartbeat_interval;
        debug!("Node {}, schedule log replication task {id} every {period:?}", self.node_id);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback(id);
            }
        });
        LogReplicationTask::new(self.track(id, task.abort_handle()))
    }

    /// Number of timers that have neither fired for good nor been cancelled.
    pub fn outstanding(&mut self) -> usize {
        self.prune();
        self.outstanding.len()
    }

    /// Cancels every outstanding timer of this node.
    pub fn stop(&mut self) {
        debug!("Node {}, stop scheduler", self.node_id);
        for (_, abort) in self.outstanding.drain() {
            abort.abort();
        }
    }

    fn allocate_id(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn track(&mut self, id: TimerId, abort: AbortHandle) -> TimerHandle {
        self.prune();
        self.outstanding.insert(id, abort.clone());
        TimerHandle {
            id,
            abort: Some(abort),
        }
    }

    fn prune(&mut self) {
        self.outstanding.retain(|_, abort| !abort.is_finished());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
