//! Task state machine and task/executor descriptors.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::ids::{AgentId, ExecutorId, FrameworkId, StatusUuid, TaskId};
use crate::resources::Resources;

/// Task state as observed by the master.
///
/// # State Transitions
///
/// ```text
/// Staging -> Starting -> Running -> {Finished, Failed, Killed, Error}
///     |          |          |
///     v          v          v
///   Lost       Lost     Killing -> Killed
/// ```
///
/// `Unreachable` and `Unknown` are reconciliation answers, not transitions
/// the agent reports: a task lands on them when its agent partitions away
/// or when the master has no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Accepted by the master, not yet delivered to the agent's executor.
    Staging,
    /// The executor is launching the task.
    Starting,
    /// The task is running.
    Running,
    /// A kill was issued and is in flight.
    Killing,
    /// Terminal: completed successfully.
    Finished,
    /// Terminal: exited with a failure.
    Failed,
    /// Terminal: killed at a framework's or the master's request.
    Killed,
    /// Terminal: the task description was invalid.
    Error,
    /// Terminal: the task was lost (agent removed or task unaccounted for).
    Lost,
    /// The task's agent is unreachable; the task may still be running.
    Unreachable,
    /// The master has no knowledge of the task.
    Unknown,
}

impl TaskState {
    /// True for states after which no further transitions happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
        )
    }
}

/// Framework-provided task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    /// Agent the task must launch on; must match the offers it consumes.
    pub agent_id: AgentId,
    pub resources: Resources,
    /// Optional dedicated executor; tasks without one use the agent default.
    pub executor: Option<ExecutorInfo>,
}

impl TaskInfo {
    /// Create a task description.
    pub fn new(
        task_id: TaskId,
        name: impl Into<String>,
        agent_id: AgentId,
        resources: Resources,
    ) -> Self {
        Self {
            task_id,
            name: name.into(),
            agent_id,
            resources,
            executor: None,
        }
    }

    /// Attach a dedicated executor.
    pub fn with_executor(mut self, executor: ExecutorInfo) -> Self {
        self.executor = Some(executor);
        self
    }
}

/// A single status update for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub agent_id: Option<AgentId>,
    pub message: Option<String>,
    /// Present on agent-originated updates; acknowledged by uuid. Absent on
    /// master-generated updates (reconciliation answers are not retried).
    pub uuid: Option<StatusUuid>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// An agent-originated update carrying an acknowledgement uuid.
    pub fn from_agent(task_id: TaskId, agent_id: AgentId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            agent_id: Some(agent_id),
            message: None,
            uuid: Some(StatusUuid::new()),
            timestamp: Utc::now(),
        }
    }

    /// A master-generated update (reconciliation answer, lost task, ...).
    pub fn from_master(task_id: TaskId, agent_id: Option<AgentId>, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            agent_id,
            message: None,
            uuid: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Executor description: a long-lived task host on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub framework_id: Option<FrameworkId>,
    pub resources: Resources,
}

impl ExecutorInfo {
    /// Create an executor description.
    pub fn new(executor_id: ExecutorId, resources: Resources) -> Self {
        Self {
            executor_id,
            framework_id: None,
            resources,
        }
    }
}

/// A task as reported by a re-registering agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub framework_id: FrameworkId,
    pub info: TaskInfo,
    pub state: TaskState,
}
