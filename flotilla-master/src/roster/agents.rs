//! The agent arena: live agents, their tasks and executors, and the
//! lifecycle bookkeeping sets around them.
//!
//! Tasks live here, owned by the agent that runs them; frameworks index
//! into this arena by id. Used-resources counters are maintained by the
//! charge/discharge helpers on [`Agent`], never written directly, so that
//! `sum(task.resources + executor.resources) == used[framework]` holds at
//! every quiescent point.

// Layer 1: Standard library imports
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use tracing::warn;

// Layer 3: Internal module imports
use crate::event::AgentConn;
use flotilla_model::{
    AgentId, AgentInfo, ExecutorId, ExecutorInfo, FrameworkId, InverseOfferId, OfferId, PeerAddr,
    Resources, TaskId, TaskInfo, TaskState, TaskStatus,
};

/// A task owned by the agent arena.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub info: TaskInfo,
    pub framework_id: FrameworkId,
    pub state: TaskState,
    pub latest_status: Option<TaskStatus>,
    /// True while the task's resources are charged against the agent's
    /// used counter. Cleared once, on the first terminal transition.
    pub resources_charged: bool,
}

impl Task {
    pub(crate) fn staging(framework_id: FrameworkId, info: TaskInfo) -> Self {
        Self {
            info,
            framework_id,
            state: TaskState::Staging,
            latest_status: None,
            resources_charged: true,
        }
    }
}

/// One live agent.
#[derive(Debug)]
pub(crate) struct Agent {
    pub id: AgentId,
    pub info: AgentInfo,
    pub conn: AgentConn,
    pub version: String,
    pub connected: bool,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub reregistered_at: Option<DateTime<Utc>>,
    /// Bumped on every connect/disconnect; timers carry the epoch they
    /// were armed under and stale firings are ignored.
    pub epoch: u64,
    /// Static resources with all applied operations re-applied.
    pub total: Resources,
    /// Dynamic reservations and persistent volumes that survive agent
    /// restart.
    pub checkpointed: Resources,
    pub tasks: HashMap<FrameworkId, HashMap<TaskId, Task>>,
    pub executors: HashMap<FrameworkId, HashMap<ExecutorId, ExecutorInfo>>,
    /// Tasks accepted but still suspended on authorization.
    pub pending_tasks: HashMap<FrameworkId, HashSet<TaskId>>,
    /// Kill-list: tasks killed while unreachable or unreported, consulted
    /// during re-registration reconciliation.
    pub killed_tasks: HashMap<FrameworkId, HashSet<TaskId>>,
    pub offers: HashSet<OfferId>,
    pub inverse_offers: HashSet<InverseOfferId>,
    used: HashMap<FrameworkId, Resources>,
    pub offered: Resources,
}

impl Agent {
    pub(crate) fn new(
        id: AgentId,
        info: AgentInfo,
        conn: AgentConn,
        checkpointed: Resources,
        version: String,
        epoch: u64,
    ) -> Self {
        let total = compute_total(&info.resources, &checkpointed);
        Self {
            id,
            info,
            conn,
            version,
            connected: true,
            active: true,
            registered_at: Utc::now(),
            reregistered_at: None,
            epoch,
            total,
            checkpointed,
            tasks: HashMap::new(),
            executors: HashMap::new(),
            pending_tasks: HashMap::new(),
            killed_tasks: HashMap::new(),
            offers: HashSet::new(),
            inverse_offers: HashSet::new(),
            used: HashMap::new(),
            offered: Resources::empty(),
        }
    }

    /// Add a task, charging its resources if the task is charged.
    pub(crate) fn add_task(&mut self, task: Task) {
        if task.resources_charged {
            let used = self.used.entry(task.framework_id.clone()).or_default();
            *used += task.info.resources.clone();
        }
        self.tasks
            .entry(task.framework_id.clone())
            .or_default()
            .insert(task.info.task_id.clone(), task);
    }

    pub(crate) fn task(&self, framework_id: &FrameworkId, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(framework_id)?.get(task_id)
    }

    pub(crate) fn task_mut(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
    ) -> Option<&mut Task> {
        self.tasks.get_mut(framework_id)?.get_mut(task_id)
    }

    /// Discharge a task's resources on its first terminal transition.
    ///
    /// Returns the discharged resources, or `None` if already discharged.
    pub(crate) fn discharge_task(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
    ) -> Option<Resources> {
        let task = self.tasks.get_mut(framework_id)?.get_mut(task_id)?;
        if !task.resources_charged {
            return None;
        }
        task.resources_charged = false;
        let resources = task.info.resources.clone();
        self.subtract_used(framework_id, &resources);
        Some(resources)
    }

    /// Remove a task, discharging it if still charged. The returned task's
    /// `resources_charged` flag reflects whether it was charged at removal
    /// time, so callers know whether to recover its resources elsewhere.
    pub(crate) fn remove_task(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
    ) -> Option<Task> {
        let per_framework = self.tasks.get_mut(framework_id)?;
        let task = per_framework.remove(task_id)?;
        if per_framework.is_empty() {
            self.tasks.remove(framework_id);
        }
        if task.resources_charged {
            let resources = task.info.resources.clone();
            self.subtract_used(framework_id, &resources);
        }
        if let Some(killed) = self.killed_tasks.get_mut(framework_id) {
            killed.remove(task_id);
        }
        Some(task)
    }

    /// Add an executor, charging its resources.
    pub(crate) fn add_executor(&mut self, framework_id: FrameworkId, executor: ExecutorInfo) {
        let per_framework = self.executors.entry(framework_id.clone()).or_default();
        if per_framework.contains_key(&executor.executor_id) {
            return;
        }
        let used = self.used.entry(framework_id).or_default();
        *used += executor.resources.clone();
        per_framework.insert(executor.executor_id.clone(), executor);
    }

    /// Remove an executor, discharging its resources.
    pub(crate) fn remove_executor(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<ExecutorInfo> {
        let per_framework = self.executors.get_mut(framework_id)?;
        let executor = per_framework.remove(executor_id)?;
        if per_framework.is_empty() {
            self.executors.remove(framework_id);
        }
        self.subtract_used(framework_id, &executor.resources);
        Some(executor)
    }

    /// Used resources charged to one framework on this agent.
    pub(crate) fn used_by(&self, framework_id: &FrameworkId) -> Resources {
        self.used.get(framework_id).cloned().unwrap_or_default()
    }

    /// The per-framework used partition.
    pub(crate) fn used(&self) -> &HashMap<FrameworkId, Resources> {
        &self.used
    }

    /// Used resources summed over frameworks (scalar view).
    pub(crate) fn used_total(&self) -> Resources {
        self.used
            .values()
            .fold(Resources::empty(), |acc, r| acc + r.clone())
    }

    /// Resources not used and not promised in outstanding offers.
    pub(crate) fn available(&self) -> Resources {
        let committed = self.used_total() + self.offered.clone();
        self.total.checked_sub(&committed).unwrap_or_else(|_| {
            warn!(agent_id = %self.id, "agent is overcommitted");
            Resources::empty()
        })
    }

    /// Verify the used-counter invariant by recomputation. Test support.
    #[cfg(test)]
    pub(crate) fn used_counters_consistent(&self) -> bool {
        let mut recomputed: HashMap<&FrameworkId, Resources> = HashMap::new();
        for (framework_id, tasks) in &self.tasks {
            for task in tasks.values() {
                if task.resources_charged {
                    let entry = recomputed.entry(framework_id).or_default();
                    *entry += task.info.resources.clone();
                }
            }
        }
        for (framework_id, executors) in &self.executors {
            for executor in executors.values() {
                let entry = recomputed.entry(framework_id).or_default();
                *entry += executor.resources.clone();
            }
        }
        self.used
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .all(|(id, r)| recomputed.get(id) == Some(r))
            && recomputed
                .iter()
                .all(|(id, r)| self.used.get(*id).is_some_and(|have| have == r))
    }

    fn subtract_used(&mut self, framework_id: &FrameworkId, resources: &Resources) {
        let Some(used) = self.used.get_mut(framework_id) else {
            warn!(agent_id = %self.id, framework_id = %framework_id,
                "discharging resources for an uncharged framework");
            return;
        };
        match used.checked_sub(resources) {
            Ok(rest) => {
                if rest.is_empty() {
                    self.used.remove(framework_id);
                } else {
                    *used = rest;
                }
            }
            Err(error) => {
                warn!(agent_id = %self.id, framework_id = %framework_id, %error,
                    "used counter underflow");
                self.used.remove(framework_id);
            }
        }
    }
}

/// Total resources: the static declaration with checkpointed reservations
/// and volumes re-applied (the checkpointed flavor replaces its unreserved
/// equivalent).
pub(crate) fn compute_total(declared: &Resources, checkpointed: &Resources) -> Resources {
    match declared.checked_sub(&checkpointed.as_unreserved()) {
        Ok(rest) => rest + checkpointed.clone(),
        Err(error) => {
            warn!(%error, "checkpointed resources exceed declared resources; ignoring them");
            declared.clone()
        }
    }
}

/// LRU-bounded tombstones for removed agents.
///
/// A stale agent re-registering with a tombstoned id is explicitly refused
/// rather than treated as unknown. Past the bound the oldest tombstone is
/// evicted and its id behaves like unknown again.
#[derive(Debug)]
pub(crate) struct RemovedCache {
    order: VecDeque<AgentId>,
    present: HashSet<AgentId>,
    capacity: usize,
}

impl RemovedCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            present: HashSet::new(),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, id: AgentId) {
        if self.capacity == 0 || !self.present.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.present.remove(&evicted);
            }
        }
    }

    pub(crate) fn contains(&self, id: &AgentId) -> bool {
        self.present.contains(id)
    }
}

/// The live-agent roster plus lifecycle bookkeeping sets.
#[derive(Debug)]
pub(crate) struct AgentRoster {
    agents: HashMap<AgentId, Agent>,
    by_address: HashMap<PeerAddr, AgentId>,
    /// Learned from the registry after failover, not yet heard from.
    pub recovered: HashMap<AgentId, AgentInfo>,
    /// Admissions in flight, keyed by the registering address.
    pub registering: HashSet<PeerAddr>,
    /// Re-admissions (MarkReachable) in flight.
    pub reregistering: HashSet<AgentId>,
    /// MarkUnreachable/Remove commits in flight.
    pub removing: HashSet<AgentId>,
    /// In-memory mirror of the registry's unreachable list.
    pub unreachable: BTreeMap<AgentId, DateTime<Utc>>,
    pub removed: RemovedCache,
}

impl AgentRoster {
    pub(crate) fn new(max_removed: usize) -> Self {
        Self {
            agents: HashMap::new(),
            by_address: HashMap::new(),
            recovered: HashMap::new(),
            registering: HashSet::new(),
            reregistering: HashSet::new(),
            removing: HashSet::new(),
            unreachable: BTreeMap::new(),
            removed: RemovedCache::new(max_removed),
        }
    }

    pub(crate) fn insert(&mut self, agent: Agent) {
        self.by_address
            .insert(agent.conn.peer.clone(), agent.id.clone());
        self.agents.insert(agent.id.clone(), agent);
    }

    pub(crate) fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub(crate) fn by_address(&self, addr: &PeerAddr) -> Option<&Agent> {
        self.by_address.get(addr).and_then(|id| self.agents.get(id))
    }

    pub(crate) fn id_by_address(&self, addr: &PeerAddr) -> Option<&AgentId> {
        self.by_address.get(addr)
    }

    pub(crate) fn remove(&mut self, id: &AgentId) -> Option<Agent> {
        let agent = self.agents.remove(id)?;
        // Only drop the address index if it still points at this agent; a
        // newer connection may have claimed the address already.
        if self.by_address.get(&agent.conn.peer) == Some(id) {
            self.by_address.remove(&agent.conn.peer);
        }
        Some(agent)
    }

    /// Rebind an agent to a new connection (new address wins).
    pub(crate) fn rebind(&mut self, id: &AgentId, conn: AgentConn) {
        if let Some(agent) = self.agents.get_mut(id) {
            if self.by_address.get(&agent.conn.peer) == Some(id) {
                self.by_address.remove(&agent.conn.peer);
            }
            self.by_address.insert(conn.peer.clone(), id.clone());
            agent.conn = conn;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Ids of live agents, sorted for deterministic iteration.
    pub(crate) fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(addr: &str) -> AgentConn {
        let (tx, _rx) = mpsc::unbounded_channel();
        AgentConn::new(PeerAddr::new(addr), tx)
    }

    fn agent(id: &str, addr: &str, cpus: f64) -> Agent {
        let info = AgentInfo::new(id, PeerAddr::new(addr), Resources::cpus(cpus))
            .with_id(AgentId::new(id));
        Agent::new(
            AgentId::new(id),
            info,
            conn(addr),
            Resources::empty(),
            "0.1.0".to_owned(),
            1,
        )
    }

    fn task(fw: &str, id: &str, cpus: f64) -> Task {
        Task::staging(
            FrameworkId::new(fw),
            TaskInfo::new(
                TaskId::new(id),
                id,
                AgentId::new("a1"),
                Resources::cpus(cpus),
            ),
        )
    }

    #[test]
    fn test_task_charging() {
        let mut agent = agent("a1", "10.0.0.1:5051", 4.0);
        agent.add_task(task("f1", "t1", 1.0));
        agent.add_task(task("f1", "t2", 0.5));

        assert_eq!(agent.used_by(&FrameworkId::new("f1")), Resources::cpus(1.5));
        assert!(agent.used_counters_consistent());
    }

    #[test]
    fn test_discharge_is_idempotent() {
        let mut agent = agent("a1", "10.0.0.1:5051", 4.0);
        agent.add_task(task("f1", "t1", 1.0));
        let fw = FrameworkId::new("f1");
        let t1 = TaskId::new("t1");

        assert_eq!(agent.discharge_task(&fw, &t1), Some(Resources::cpus(1.0)));
        // Second discharge (e.g. duplicate terminal update) is a no-op.
        assert_eq!(agent.discharge_task(&fw, &t1), None);
        assert!(agent.used_by(&fw).is_empty());
        assert!(agent.used_counters_consistent());
    }

    #[test]
    fn test_remove_discharged_task_does_not_double_subtract() {
        let mut agent = agent("a1", "10.0.0.1:5051", 4.0);
        agent.add_task(task("f1", "t1", 1.0));
        agent.add_task(task("f1", "t2", 2.0));
        let fw = FrameworkId::new("f1");

        agent.discharge_task(&fw, &TaskId::new("t1")).unwrap();
        agent.remove_task(&fw, &TaskId::new("t1")).unwrap();

        assert_eq!(agent.used_by(&fw), Resources::cpus(2.0));
        assert!(agent.used_counters_consistent());
    }

    #[test]
    fn test_executor_accounting() {
        let mut agent = agent("a1", "10.0.0.1:5051", 4.0);
        let fw = FrameworkId::new("f1");
        let executor = ExecutorInfo::new(ExecutorId::new("e1"), Resources::cpus(0.5));

        agent.add_executor(fw.clone(), executor.clone());
        // Re-adding the same executor does not double-charge.
        agent.add_executor(fw.clone(), executor);
        assert_eq!(agent.used_by(&fw), Resources::cpus(0.5));

        agent.remove_executor(&fw, &ExecutorId::new("e1")).unwrap();
        assert!(agent.used_by(&fw).is_empty());
        assert!(agent.used_counters_consistent());
    }

    #[test]
    fn test_available_subtracts_used_and_offered() {
        let mut agent = agent("a1", "10.0.0.1:5051", 4.0);
        agent.add_task(task("f1", "t1", 1.0));
        agent.offered = Resources::cpus(2.0);

        assert_eq!(agent.available(), Resources::cpus(1.0));
    }

    #[test]
    fn test_compute_total_applies_checkpointed() {
        use flotilla_model::resources::{Resource, CPUS};

        let declared = Resources::cpus(4.0);
        let checkpointed =
            Resources::from_entries(vec![Resource::scalar(CPUS, 1.0).with_role("web")]);
        let total = compute_total(&declared, &checkpointed);

        assert_eq!(total.scalar("cpus"), 4.0);
        assert_eq!(total.unreserved(), Resources::cpus(3.0));
    }

    #[test]
    fn test_compute_total_ignores_excess_checkpointed() {
        use flotilla_model::resources::{Resource, CPUS};

        let declared = Resources::cpus(1.0);
        let checkpointed =
            Resources::from_entries(vec![Resource::scalar(CPUS, 2.0).with_role("web")]);
        assert_eq!(compute_total(&declared, &checkpointed), declared);
    }

    #[test]
    fn test_removed_cache_lru_bound() {
        let mut cache = RemovedCache::new(2);
        cache.insert(AgentId::new("a1"));
        cache.insert(AgentId::new("a2"));
        cache.insert(AgentId::new("a3"));

        // a1 fell off the bound: its id behaves like unknown again.
        assert!(!cache.contains(&AgentId::new("a1")));
        assert!(cache.contains(&AgentId::new("a2")));
        assert!(cache.contains(&AgentId::new("a3")));
    }

    #[test]
    fn test_roster_rebind_new_address_wins() {
        let mut roster = AgentRoster::new(10);
        roster.insert(agent("a1", "10.0.0.1:5051", 4.0));

        roster.rebind(&AgentId::new("a1"), conn("10.0.0.2:5051"));

        assert!(roster.by_address(&PeerAddr::new("10.0.0.1:5051")).is_none());
        assert_eq!(
            roster
                .by_address(&PeerAddr::new("10.0.0.2:5051"))
                .map(|a| a.id.clone()),
            Some(AgentId::new("a1"))
        );
    }

    #[test]
    fn test_roster_remove_keeps_newer_address_binding() {
        let mut roster = AgentRoster::new(10);
        roster.insert(agent("a1", "10.0.0.1:5051", 4.0));
        // A second agent claims the same address (old transport dead).
        roster.insert(agent("a2", "10.0.0.1:5051", 4.0));

        roster.remove(&AgentId::new("a1"));
        assert_eq!(
            roster.id_by_address(&PeerAddr::new("10.0.0.1:5051")),
            Some(&AgentId::new("a2"))
        );
    }
}
