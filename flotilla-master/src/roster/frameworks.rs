//! The framework roster: live frameworks, their transports, and the
//! bounded ring of completed frameworks.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

// Layer 3: Internal module imports
use crate::event::{ConnectionKind, SchedulerConn};
use flotilla_model::{
    AgentId, FrameworkId, FrameworkInfo, InverseOfferId, OfferId, PeerAddr, SchedulerEvent,
    StreamId, TaskId, TaskInfo, TaskState,
};

/// Heartbeat task bound to one HTTP transport. Aborted when the transport
/// is replaced or torn down; it also exits on its own once the stream's
/// receiver is gone.
#[derive(Debug)]
pub(crate) struct Heartbeater {
    handle: JoinHandle<()>,
}

impl Heartbeater {
    /// Wrap a spawned heartbeat task; the task is aborted on drop.
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the heartbeat task for a streaming connection.
pub(crate) fn spawn_heartbeater(
    sender: mpsc::UnboundedSender<SchedulerEvent>,
    interval: Duration,
) -> Heartbeater {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the subscriber already got its
        // Subscribed event, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender.send(SchedulerEvent::Heartbeat).is_err() {
                break;
            }
        }
    });
    Heartbeater { handle }
}

/// How a framework is reachable. Exactly one variant is live at any time;
/// upgrades and downgrades between the two replace the whole variant.
#[derive(Debug)]
pub(crate) enum FrameworkTransport {
    /// Message-passing endpoint.
    Pid { conn: SchedulerConn },
    /// Streaming HTTP connection with its heartbeater.
    Http {
        stream_id: StreamId,
        conn: SchedulerConn,
        heartbeater: Heartbeater,
    },
}

impl FrameworkTransport {
    /// Build a transport for a connection, spawning a heartbeater for
    /// streaming connections.
    pub(crate) fn for_conn(conn: SchedulerConn, heartbeat_interval: Duration) -> Self {
        match conn.kind {
            ConnectionKind::Pid => FrameworkTransport::Pid { conn },
            ConnectionKind::Http => {
                let heartbeater = spawn_heartbeater(conn.sender.clone(), heartbeat_interval);
                FrameworkTransport::Http {
                    stream_id: StreamId::new(),
                    conn,
                    heartbeater,
                }
            }
        }
    }

    pub(crate) fn peer(&self) -> &PeerAddr {
        match self {
            FrameworkTransport::Pid { conn } | FrameworkTransport::Http { conn, .. } => &conn.peer,
        }
    }

    /// Best-effort event delivery.
    pub(crate) fn send(&self, event: SchedulerEvent) -> bool {
        match self {
            FrameworkTransport::Pid { conn } | FrameworkTransport::Http { conn, .. } => {
                conn.send(event)
            }
        }
    }
}

/// A completed task retained in a framework's bounded ring.
#[derive(Debug, Clone)]
pub(crate) struct CompletedTask {
    pub info: TaskInfo,
    pub agent_id: AgentId,
    pub state: TaskState,
    pub finished_at: DateTime<Utc>,
}

/// One live framework.
#[derive(Debug)]
pub(crate) struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub transport: FrameworkTransport,
    pub connected: bool,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub reregistered_at: Option<DateTime<Utc>>,
    /// Bumped on every transport change; failover timers carry the epoch
    /// they were armed under and stale firings are ignored.
    pub epoch: u64,
    /// Index into the agent arena: which agent runs each task.
    pub tasks: HashMap<TaskId, AgentId>,
    /// Tasks accepted but still suspended on authorization.
    pub pending_tasks: HashMap<TaskId, AgentId>,
    pub completed_tasks: VecDeque<CompletedTask>,
    pub offers: HashSet<OfferId>,
    pub inverse_offers: HashSet<InverseOfferId>,
}

impl Framework {
    pub(crate) fn new(
        id: FrameworkId,
        info: FrameworkInfo,
        transport: FrameworkTransport,
        epoch: u64,
    ) -> Self {
        Self {
            id,
            info,
            transport,
            connected: true,
            active: true,
            registered_at: Utc::now(),
            reregistered_at: None,
            epoch,
            tasks: HashMap::new(),
            pending_tasks: HashMap::new(),
            completed_tasks: VecDeque::new(),
            offers: HashSet::new(),
            inverse_offers: HashSet::new(),
        }
    }

    pub(crate) fn principal(&self) -> Option<&str> {
        self.info.principal.as_deref()
    }

    /// The framework's failover timeout, falling back to the master's
    /// configured default.
    pub(crate) fn failover_timeout(&self, default: Duration) -> Duration {
        self.info.failover_timeout.unwrap_or(default)
    }

    /// Best-effort event delivery over the current transport.
    pub(crate) fn send(&self, event: SchedulerEvent) -> bool {
        self.transport.send(event)
    }

    /// Retain a finished task in the bounded completed ring.
    pub(crate) fn push_completed_task(&mut self, task: CompletedTask, bound: usize) {
        self.completed_tasks.push_back(task);
        while self.completed_tasks.len() > bound {
            self.completed_tasks.pop_front();
        }
    }
}

/// A torn-down framework retained in the completed ring.
#[derive(Debug)]
pub(crate) struct CompletedFramework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub registered_at: DateTime<Utc>,
    pub unregistered_at: DateTime<Utc>,
    pub completed_tasks: VecDeque<CompletedTask>,
}

/// All live frameworks plus the completed ring.
#[derive(Debug)]
pub(crate) struct FrameworkRoster {
    frameworks: HashMap<FrameworkId, Framework>,
    completed: VecDeque<CompletedFramework>,
    /// Frameworks learned from re-registering agents after a master
    /// failover, not yet re-subscribed.
    pub recovered: HashMap<FrameworkId, FrameworkInfo>,
    max_completed: usize,
}

impl FrameworkRoster {
    pub(crate) fn new(max_completed: usize) -> Self {
        Self {
            frameworks: HashMap::new(),
            completed: VecDeque::new(),
            recovered: HashMap::new(),
            max_completed,
        }
    }

    pub(crate) fn insert(&mut self, framework: Framework) {
        self.frameworks.insert(framework.id.clone(), framework);
    }

    pub(crate) fn get(&self, id: &FrameworkId) -> Option<&Framework> {
        self.frameworks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &FrameworkId) -> Option<&mut Framework> {
        self.frameworks.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &FrameworkId) -> bool {
        self.frameworks.contains_key(id)
    }

    pub(crate) fn remove(&mut self, id: &FrameworkId) -> Option<Framework> {
        self.frameworks.remove(id)
    }

    /// The live framework connected over `peer`, if any.
    pub(crate) fn id_by_peer(&self, peer: &PeerAddr) -> Option<FrameworkId> {
        self.frameworks
            .values()
            .find(|f| f.transport.peer() == peer)
            .map(|f| f.id.clone())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.values()
    }

    /// Move a torn-down framework into the completed ring.
    pub(crate) fn complete(&mut self, framework: Framework) {
        debug!(framework_id = %framework.id, completed_tasks = framework.completed_tasks.len(),
            "retaining framework in the completed ring");
        self.completed.push_back(CompletedFramework {
            id: framework.id,
            info: framework.info,
            registered_at: framework.registered_at,
            unregistered_at: Utc::now(),
            completed_tasks: framework.completed_tasks,
        });
        while self.completed.len() > self.max_completed {
            self.completed.pop_front();
        }
    }

    pub(crate) fn completed(&self) -> impl Iterator<Item = &CompletedFramework> {
        self.completed.iter()
    }

    pub(crate) fn is_completed(&self, id: &FrameworkId) -> bool {
        self.completed.iter().any(|f| &f.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_model::Resources;

    fn conn(addr: &str) -> SchedulerConn {
        let (tx, _rx) = mpsc::unbounded_channel();
        SchedulerConn::new(PeerAddr::new(addr), ConnectionKind::Pid, tx)
    }

    fn framework(id: &str, addr: &str) -> Framework {
        Framework::new(
            FrameworkId::new(id),
            FrameworkInfo::new(id, "role"),
            FrameworkTransport::Pid { conn: conn(addr) },
            1,
        )
    }

    fn completed_task(id: &str) -> CompletedTask {
        CompletedTask {
            info: TaskInfo::new(
                TaskId::new(id),
                id,
                AgentId::new("a1"),
                Resources::cpus(1.0),
            ),
            agent_id: AgentId::new("a1"),
            state: TaskState::Finished,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_failover_timeout_fallback() {
        let f = framework("f1", "10.0.0.1:36000");
        assert_eq!(
            f.failover_timeout(Duration::from_secs(60)),
            Duration::from_secs(60)
        );

        let mut with_own = framework("f2", "10.0.0.2:36000");
        with_own.info.failover_timeout = Some(Duration::from_secs(5));
        assert_eq!(
            with_own.failover_timeout(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_completed_task_ring_bound() {
        let mut f = framework("f1", "10.0.0.1:36000");
        for i in 0..5 {
            f.push_completed_task(completed_task(&format!("t{i}")), 3);
        }
        assert_eq!(f.completed_tasks.len(), 3);
        assert_eq!(f.completed_tasks[0].info.task_id, TaskId::new("t2"));
    }

    #[test]
    fn test_completed_framework_ring_bound() {
        let mut roster = FrameworkRoster::new(2);
        for i in 0..4 {
            roster.complete(framework(&format!("f{i}"), "10.0.0.1:36000"));
        }
        assert_eq!(roster.completed().count(), 2);
        assert!(!roster.is_completed(&FrameworkId::new("f0")));
        assert!(roster.is_completed(&FrameworkId::new("f3")));
    }

    #[test]
    fn test_id_by_peer() {
        let mut roster = FrameworkRoster::new(10);
        roster.insert(framework("f1", "10.0.0.1:36000"));

        assert_eq!(
            roster.id_by_peer(&PeerAddr::new("10.0.0.1:36000")),
            Some(FrameworkId::new("f1"))
        );
        assert_eq!(roster.id_by_peer(&PeerAddr::new("10.0.0.9:36000")), None);
    }
}
