//! Task accounting: status updates, acknowledgements, kills, executor
//! exits, and reconciliation.
//!
//! Status updates are at-least-once: agents retry until acknowledged, so
//! duplicates are tolerated everywhere (discharge happens once, the ack
//! path is keyed by uuid). Unknown tasks are still forwarded best effort
//! so stragglers can observe terminal states.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use chrono::Utc;
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use crate::allocator::Allocator;
use crate::auth::{Authenticator, Authorizer};
use crate::event::SchedulerConn;
use crate::master::Master;
use crate::roster::CompletedTask;
use flotilla_model::{
    AgentId, AgentMessage, ExecutorId, FrameworkId, MasterEvent, ReconcileTask, Resources,
    SchedulerEvent, StatusUpdate, StatusUuid, TaskId, TaskState, TaskStatus,
};

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: flotilla_registrar::Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    // -- status updates ----------------------------------------------------

    pub(crate) fn handle_status_update(&mut self, update: StatusUpdate) {
        let StatusUpdate {
            framework_id,
            status,
        } = update;
        let Some(agent_id) = status.agent_id.clone() else {
            warn!(task_id = %status.task_id, "status update without agent id, dropping");
            return;
        };
        self.metrics.status_updates += 1;

        let known = self
            .agents
            .get(&agent_id)
            .and_then(|agent| agent.task(&framework_id, &status.task_id))
            .is_some();
        if known {
            let mut recovered: Option<Resources> = None;
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                if let Some(task) = agent.task_mut(&framework_id, &status.task_id) {
                    let duplicate = status.uuid.is_some()
                        && task.latest_status.as_ref().and_then(|s| s.uuid) == status.uuid;
                    if duplicate {
                        // Agents retry until acknowledged; duplicates are
                        // forwarded but must not double-account.
                        debug!(task_id = %status.task_id, "duplicate status update");
                    }
                    task.state = status.state;
                    task.latest_status = Some(status.clone());
                }
                if status.state.is_terminal() {
                    // First terminal transition frees the resources; the
                    // task object stays until acknowledged.
                    recovered = agent.discharge_task(&framework_id, &status.task_id);
                }
            }
            if let Some(resources) = recovered {
                self.allocator
                    .recover_resources(&framework_id, &agent_id, &resources, None);
            }
        } else {
            // Forwarded anyway: the framework may be waiting on a terminal
            // state for a task this master never knew.
            debug!(%framework_id, task_id = %status.task_id, "status update for unknown task");
        }

        if let Some(framework) = self.frameworks.get(&framework_id) {
            if framework.connected {
                if let Some(uuid) = status.uuid {
                    self.pending_acks.insert(
                        (agent_id.clone(), framework_id.clone(), status.task_id.clone()),
                        uuid,
                    );
                }
                framework.send(SchedulerEvent::Update {
                    status: status.clone(),
                });
            }
        }
        self.subscribers.broadcast(MasterEvent::TaskUpdated {
            framework_id,
            task_id: status.task_id,
            state: status.state,
        });
    }

    pub(crate) fn handle_acknowledge(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        agent_id: AgentId,
        task_id: TaskId,
        uuid: StatusUuid,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        let key = (agent_id.clone(), framework_id.clone(), task_id.clone());
        if self.pending_acks.get(&key) != Some(&uuid) {
            self.metrics.invalid_acks += 1;
            warn!(%framework_id, %task_id, "acknowledgement matches no forwarded update");
            return;
        }
        self.pending_acks.remove(&key);

        if let Some(agent) = self.agents.get(&agent_id) {
            if agent.connected {
                agent.conn.send(AgentMessage::StatusUpdateAck {
                    framework_id: framework_id.clone(),
                    task_id: task_id.clone(),
                    uuid,
                });
            }
        }

        // A terminal update, once acknowledged, releases the task object
        // into the completed ring.
        let terminal_state = self
            .agents
            .get(&agent_id)
            .and_then(|agent| agent.task(&framework_id, &task_id))
            .map(|task| task.state)
            .filter(TaskState::is_terminal);
        if let Some(state) = terminal_state {
            let removed = self
                .agents
                .get_mut(&agent_id)
                .and_then(|agent| agent.remove_task(&framework_id, &task_id));
            if let Some(task) = removed {
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.tasks.remove(&task_id);
                    framework.push_completed_task(
                        CompletedTask {
                            info: task.info,
                            agent_id,
                            state,
                            finished_at: Utc::now(),
                        },
                        self.config.max_completed_tasks_per_framework,
                    );
                }
            }
        }
    }

    // -- terminal transitions driven by the master -------------------------

    /// Force a task into a terminal state: remove it everywhere, recover
    /// its resources, notify the framework and subscribers.
    pub(crate) fn finish_task(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        state: TaskState,
        message: &str,
    ) {
        let removed = self
            .agents
            .get_mut(agent_id)
            .and_then(|agent| agent.remove_task(framework_id, task_id));
        let Some(task) = removed else {
            return;
        };
        if task.resources_charged {
            self.allocator
                .recover_resources(framework_id, agent_id, &task.info.resources, None);
        }
        self.pending_acks
            .remove(&(agent_id.clone(), framework_id.clone(), task_id.clone()));

        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            framework.tasks.remove(task_id);
            framework.push_completed_task(
                CompletedTask {
                    info: task.info,
                    agent_id: agent_id.clone(),
                    state,
                    finished_at: Utc::now(),
                },
                self.config.max_completed_tasks_per_framework,
            );
            let status =
                TaskStatus::from_master(task_id.clone(), Some(agent_id.clone()), state)
                    .with_message(message);
            framework.send(SchedulerEvent::Update { status });
        }
        self.subscribers.broadcast(MasterEvent::TaskUpdated {
            framework_id: framework_id.clone(),
            task_id: task_id.clone(),
            state,
        });
    }

    // -- kill ---------------------------------------------------------------

    pub(crate) fn handle_kill(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        task_id: TaskId,
        agent_id_hint: Option<AgentId>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }

        // Still pending on authorization: the launch continuation will
        // observe the missing pending entry and report the kill.
        let pending_agent = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|framework| framework.pending_tasks.remove(&task_id));
        if let Some(agent_id) = pending_agent {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                if let Some(pending) = agent.pending_tasks.get_mut(&framework_id) {
                    pending.remove(&task_id);
                }
            }
            info!(%framework_id, %task_id, "killed task while pending authorization");
            if let Some(framework) = self.frameworks.get(&framework_id) {
                let status = TaskStatus::from_master(
                    task_id.clone(),
                    Some(agent_id),
                    TaskState::Killed,
                )
                .with_message("task killed before launch");
                framework.send(SchedulerEvent::Update { status });
            }
            self.subscribers.broadcast(MasterEvent::TaskUpdated {
                framework_id,
                task_id,
                state: TaskState::Killed,
            });
            return;
        }

        // Live task: forward the kill if the agent is reachable, remember
        // it for reconciliation either way.
        let located = self
            .frameworks
            .get(&framework_id)
            .and_then(|framework| framework.tasks.get(&task_id))
            .cloned();
        if let Some(agent_id) = located {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                if let Some(task) = agent.task_mut(&framework_id, &task_id) {
                    if !task.state.is_terminal() {
                        task.state = TaskState::Killing;
                    }
                }
                agent
                    .killed_tasks
                    .entry(framework_id.clone())
                    .or_default()
                    .insert(task_id.clone());
                if agent.connected {
                    agent.conn.send(AgentMessage::KillTask {
                        framework_id,
                        task_id,
                    });
                } else {
                    debug!(%agent_id, %task_id, "kill deferred until the agent reconnects");
                }
            }
            return;
        }

        // Unknown to the live rosters: answer from what is remembered.
        let unreachable_agent = self
            .unreachable_tasks
            .iter()
            .find(|(_, remembered)| {
                remembered
                    .get(&framework_id)
                    .is_some_and(|ids| ids.contains(&task_id))
            })
            .map(|(agent_id, _)| agent_id.clone())
            .or_else(|| {
                agent_id_hint.filter(|hint| self.agents.unreachable.contains_key(hint))
            });
        let state = if unreachable_agent.is_some() {
            TaskState::Unreachable
        } else {
            TaskState::Unknown
        };
        if let Some(framework) = self.frameworks.get(&framework_id) {
            let status = TaskStatus::from_master(task_id, unreachable_agent, state)
                .with_message("kill for a task the master does not know");
            framework.send(SchedulerEvent::Update { status });
        }
    }

    pub(crate) fn handle_shutdown_executor(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        agent_id: AgentId,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        let Some(agent) = self.agents.get(&agent_id) else {
            conn.send(SchedulerEvent::Error {
                message: format!("unknown agent: {agent_id}"),
            });
            return;
        };
        if !agent.connected {
            debug!(%agent_id, "dropping executor shutdown for disconnected agent");
            return;
        }
        agent.conn.send(AgentMessage::ShutdownExecutor {
            framework_id,
            executor_id,
        });
    }

    pub(crate) fn handle_exited_executor(
        &mut self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) {
        let removed = self
            .agents
            .get_mut(&agent_id)
            .and_then(|agent| agent.remove_executor(&framework_id, &executor_id));
        let Some(executor) = removed else {
            return;
        };
        debug!(%agent_id, %framework_id, %executor_id, status, "executor exited");
        self.allocator
            .recover_resources(&framework_id, &agent_id, &executor.resources, None);
        if let Some(framework) = self.frameworks.get(&framework_id) {
            framework.send(SchedulerEvent::Failure {
                agent_id: Some(agent_id),
                executor_id: Some(executor_id),
            });
        }
    }

    // -- reconciliation ------------------------------------------------------

    pub(crate) fn handle_reconcile(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        tasks: Vec<ReconcileTask>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }

        let statuses: Vec<TaskStatus> = if tasks.is_empty() {
            self.implicit_reconciliation(&framework_id)
        } else {
            tasks
                .iter()
                .map(|task| self.reconcile_one(&framework_id, task))
                .collect()
        };

        let Some(framework) = self.frameworks.get(&framework_id) else {
            return;
        };
        debug!(%framework_id, count = statuses.len(), "reconciliation answered");
        for status in statuses {
            framework.send(SchedulerEvent::Update { status });
        }
    }

    /// Implicit reconciliation reports the latest state for every task
    /// the master holds for the framework, pending included.
    fn implicit_reconciliation(&self, framework_id: &FrameworkId) -> Vec<TaskStatus> {
        let Some(framework) = self.frameworks.get(framework_id) else {
            return Vec::new();
        };
        let mut statuses = Vec::new();
        for (task_id, agent_id) in &framework.pending_tasks {
            statuses.push(
                TaskStatus::from_master(task_id.clone(), Some(agent_id.clone()), TaskState::Staging)
                    .with_message("reconciliation"),
            );
        }
        for (task_id, agent_id) in &framework.tasks {
            let state = self
                .agents
                .get(agent_id)
                .and_then(|agent| agent.task(framework_id, task_id))
                .map_or(TaskState::Unknown, |task| task.state);
            statuses.push(
                TaskStatus::from_master(task_id.clone(), Some(agent_id.clone()), state)
                    .with_message("reconciliation"),
            );
        }
        statuses.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        statuses
    }

    /// Explicit reconciliation for one task: the master reports whatever
    /// it knows.
    fn reconcile_one(&self, framework_id: &FrameworkId, task: &ReconcileTask) -> TaskStatus {
        let framework = self.frameworks.get(framework_id);

        if let Some(agent_id) = framework.and_then(|f| f.pending_tasks.get(&task.task_id)) {
            return TaskStatus::from_master(
                task.task_id.clone(),
                Some(agent_id.clone()),
                TaskState::Staging,
            )
            .with_message("reconciliation");
        }
        if let Some(agent_id) = framework.and_then(|f| f.tasks.get(&task.task_id)) {
            let state = self
                .agents
                .get(agent_id)
                .and_then(|agent| agent.task(framework_id, &task.task_id))
                .map_or(TaskState::Unknown, |t| t.state);
            return TaskStatus::from_master(
                task.task_id.clone(),
                Some(agent_id.clone()),
                state,
            )
            .with_message("reconciliation");
        }
        // Remembered on an unreachable agent, by record or by hint.
        let unreachable_agent = self
            .unreachable_tasks
            .iter()
            .find(|(_, remembered)| {
                remembered
                    .get(framework_id)
                    .is_some_and(|ids| ids.contains(&task.task_id))
            })
            .map(|(agent_id, _)| agent_id.clone())
            .or_else(|| {
                task.agent_id
                    .clone()
                    .filter(|hint| self.agents.unreachable.contains_key(hint))
            });
        if let Some(agent_id) = unreachable_agent {
            return TaskStatus::from_master(
                task.task_id.clone(),
                Some(agent_id),
                TaskState::Unreachable,
            )
            .with_message("agent is unreachable");
        }
        // A completed task still in the ring answers with its final state.
        if let Some(completed) = framework.and_then(|f| {
            f.completed_tasks
                .iter()
                .rev()
                .find(|t| t.info.task_id == task.task_id)
        }) {
            return TaskStatus::from_master(
                task.task_id.clone(),
                Some(completed.agent_id.clone()),
                completed.state,
            )
            .with_message("reconciliation");
        }
        TaskStatus::from_master(task.task_id.clone(), task.agent_id.clone(), TaskState::Unknown)
            .with_message("task is unknown to the master")
    }
}
