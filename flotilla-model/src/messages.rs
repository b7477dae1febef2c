//! Wire-level call and event surface.
//!
//! Four directions of traffic converge on the master:
//!
//! - [`SchedulerCall`] / [`SchedulerEvent`] - frameworks to/from the master
//! - [`AgentCall`] / [`AgentMessage`] - agents to/from the master
//! - [`OperatorCall`] / [`OperatorResponse`] - operator API requests
//! - [`MasterEvent`] - master-level events streamed to operator subscribers
//!
//! Transport (HTTP rendering, message-passing plumbing) is out of scope;
//! these are the payloads the master validates and dispatches.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::agent::AgentInfo;
use crate::framework::FrameworkInfo;
use crate::ids::{
    AgentId, ExecutorId, FrameworkId, InverseOfferId, MachineId, OfferId, StatusUuid, StreamId,
    TaskId,
};
use crate::machine::{MaintenanceSchedule, Unavailability};
use crate::operations::Operation;
use crate::resources::Resources;
use crate::snapshot::{
    AgentSnapshot, FrameworkSnapshot, MachineStatus, QuotaInfo, RoleSnapshot, StateSnapshot,
    TaskSnapshot,
};
use crate::task::{AgentTask, ExecutorInfo, TaskInfo, TaskState, TaskStatus};

/// Offer filters attached to accept/decline calls.
///
/// `refuse_duration` asks the allocator not to re-offer the declined
/// resources to this framework for the given period.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Filters {
    pub refuse_duration: Option<Duration>,
}

/// A promise of resources on one agent to one framework.
///
/// An offer exists iff it appears in the offer ledger and in exactly one
/// framework's and one agent's offer sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Resources,
    /// Present when the agent's machine has scheduled maintenance.
    pub unavailability: Option<Unavailability>,
}

/// A request from the master to a framework to release resources on one
/// agent ahead of scheduled maintenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOffer {
    pub id: InverseOfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub unavailability: Unavailability,
    pub resources: Resources,
}

/// One task whose state a framework wants reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,
    pub agent_id: Option<AgentId>,
}

/// An advisory resource request forwarded to the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub agent_id: Option<AgentId>,
    pub resources: Resources,
}

/// Calls frameworks send to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerCall {
    /// Register (no id) or re-subscribe after failover (id present).
    Subscribe {
        framework: FrameworkInfo,
        framework_id: Option<FrameworkId>,
    },
    Teardown {
        framework_id: FrameworkId,
    },
    Accept {
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Option<Filters>,
    },
    AcceptInverseOffers {
        framework_id: FrameworkId,
        inverse_offer_ids: Vec<InverseOfferId>,
    },
    Decline {
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        filters: Option<Filters>,
    },
    DeclineInverseOffers {
        framework_id: FrameworkId,
        inverse_offer_ids: Vec<InverseOfferId>,
    },
    Revive {
        framework_id: FrameworkId,
    },
    Suppress {
        framework_id: FrameworkId,
    },
    Kill {
        framework_id: FrameworkId,
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    Shutdown {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        agent_id: AgentId,
    },
    Acknowledge {
        framework_id: FrameworkId,
        agent_id: AgentId,
        task_id: TaskId,
        uuid: StatusUuid,
    },
    /// Explicit (non-empty `tasks`) or implicit (empty) reconciliation.
    Reconcile {
        framework_id: FrameworkId,
        tasks: Vec<ReconcileTask>,
    },
    Message {
        framework_id: FrameworkId,
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    Request {
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    },
}

impl SchedulerCall {
    /// The framework the call claims to originate from, if it names one.
    pub fn framework_id(&self) -> Option<&FrameworkId> {
        match self {
            SchedulerCall::Subscribe { framework_id, .. } => framework_id.as_ref(),
            SchedulerCall::Teardown { framework_id }
            | SchedulerCall::Accept { framework_id, .. }
            | SchedulerCall::AcceptInverseOffers { framework_id, .. }
            | SchedulerCall::Decline { framework_id, .. }
            | SchedulerCall::DeclineInverseOffers { framework_id, .. }
            | SchedulerCall::Revive { framework_id }
            | SchedulerCall::Suppress { framework_id }
            | SchedulerCall::Kill { framework_id, .. }
            | SchedulerCall::Shutdown { framework_id, .. }
            | SchedulerCall::Acknowledge { framework_id, .. }
            | SchedulerCall::Reconcile { framework_id, .. }
            | SchedulerCall::Message { framework_id, .. }
            | SchedulerCall::Request { framework_id, .. } => Some(framework_id),
        }
    }

    /// Short call name for logs and dispatch errors.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerCall::Subscribe { .. } => "SUBSCRIBE",
            SchedulerCall::Teardown { .. } => "TEARDOWN",
            SchedulerCall::Accept { .. } => "ACCEPT",
            SchedulerCall::AcceptInverseOffers { .. } => "ACCEPT_INVERSE_OFFERS",
            SchedulerCall::Decline { .. } => "DECLINE",
            SchedulerCall::DeclineInverseOffers { .. } => "DECLINE_INVERSE_OFFERS",
            SchedulerCall::Revive { .. } => "REVIVE",
            SchedulerCall::Suppress { .. } => "SUPPRESS",
            SchedulerCall::Kill { .. } => "KILL",
            SchedulerCall::Shutdown { .. } => "SHUTDOWN",
            SchedulerCall::Acknowledge { .. } => "ACKNOWLEDGE",
            SchedulerCall::Reconcile { .. } => "RECONCILE",
            SchedulerCall::Message { .. } => "MESSAGE",
            SchedulerCall::Request { .. } => "REQUEST",
        }
    }
}

/// Events the master sends to frameworks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Subscribed {
        framework_id: FrameworkId,
        heartbeat_interval: Duration,
    },
    Offers {
        offers: Vec<Offer>,
    },
    InverseOffers {
        inverse_offers: Vec<InverseOffer>,
    },
    Rescind {
        offer_id: OfferId,
    },
    RescindInverseOffer {
        inverse_offer_id: InverseOfferId,
    },
    Update {
        status: TaskStatus,
    },
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    /// An agent was removed or an executor terminated.
    Failure {
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

/// A task status update forwarded from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    pub status: TaskStatus,
}

/// Calls agents send to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentCall {
    /// First registration; `agent.id` is unset.
    Register {
        agent: AgentInfo,
        checkpointed: Resources,
        version: String,
    },
    /// Re-registration after an agent restart or master failover.
    Reregister {
        agent: AgentInfo,
        checkpointed: Resources,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<AgentTask>,
        frameworks: Vec<(FrameworkId, FrameworkInfo)>,
        completed_frameworks: Vec<FrameworkId>,
        version: String,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    /// An executor exited; its resources are released.
    ExitedExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },
    /// Data from an executor to its framework.
    FrameworkMessage {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
}

/// Messages the master sends to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentMessage {
    Registered {
        agent_id: AgentId,
    },
    Reregistered {
        agent_id: AgentId,
    },
    RegistrationRefused {
        message: String,
    },
    RunTask {
        framework_id: FrameworkId,
        task: TaskInfo,
    },
    RunTaskGroup {
        framework_id: FrameworkId,
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    StatusUpdateAck {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: StatusUuid,
    },
    /// The agent must persist the new dynamic reservations and volumes.
    CheckpointResources {
        checkpointed: Resources,
    },
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    /// Kill all executors and tasks of a removed framework.
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    FrameworkMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    /// The agent itself must terminate (removed, or its machine is down).
    Shutdown {
        message: String,
    },
}

/// Operator API requests. Each is authorization-gated by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorCall {
    GetHealth,
    GetVersion,
    GetFlags,
    GetState,
    GetAgents,
    GetFrameworks,
    GetTasks,
    GetRoles,
    GetMaintenanceSchedule,
    UpdateMaintenanceSchedule { schedule: MaintenanceSchedule },
    GetMaintenanceStatus,
    /// Take the listed machines down for maintenance.
    StartMaintenance { machines: Vec<MachineId> },
    /// Bring the listed machines back up.
    StopMaintenance { machines: Vec<MachineId> },
    GetQuota,
    SetQuota { role: String, guarantee: Resources },
    RemoveQuota { role: String },
    GetWeights,
    UpdateWeights { weights: Vec<(String, f64)> },
    ReserveResources { agent_id: AgentId, resources: Resources },
    UnreserveResources { agent_id: AgentId, resources: Resources },
    CreateVolumes { agent_id: AgentId, volumes: Resources },
    DestroyVolumes { agent_id: AgentId, volumes: Resources },
    /// Declare an unreachable or misbehaving agent permanently gone.
    MarkAgentGone { agent_id: AgentId },
    /// Subscribe to the master event stream.
    Subscribe,
}

impl OperatorCall {
    /// Short call name for logs and authorization requests.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorCall::GetHealth => "GET_HEALTH",
            OperatorCall::GetVersion => "GET_VERSION",
            OperatorCall::GetFlags => "GET_FLAGS",
            OperatorCall::GetState => "GET_STATE",
            OperatorCall::GetAgents => "GET_AGENTS",
            OperatorCall::GetFrameworks => "GET_FRAMEWORKS",
            OperatorCall::GetTasks => "GET_TASKS",
            OperatorCall::GetRoles => "GET_ROLES",
            OperatorCall::GetMaintenanceSchedule => "GET_MAINTENANCE_SCHEDULE",
            OperatorCall::UpdateMaintenanceSchedule { .. } => "UPDATE_MAINTENANCE_SCHEDULE",
            OperatorCall::GetMaintenanceStatus => "GET_MAINTENANCE_STATUS",
            OperatorCall::StartMaintenance { .. } => "START_MAINTENANCE",
            OperatorCall::StopMaintenance { .. } => "STOP_MAINTENANCE",
            OperatorCall::GetQuota => "GET_QUOTA",
            OperatorCall::SetQuota { .. } => "SET_QUOTA",
            OperatorCall::RemoveQuota { .. } => "REMOVE_QUOTA",
            OperatorCall::GetWeights => "GET_WEIGHTS",
            OperatorCall::UpdateWeights { .. } => "UPDATE_WEIGHTS",
            OperatorCall::ReserveResources { .. } => "RESERVE_RESOURCES",
            OperatorCall::UnreserveResources { .. } => "UNRESERVE_RESOURCES",
            OperatorCall::CreateVolumes { .. } => "CREATE_VOLUMES",
            OperatorCall::DestroyVolumes { .. } => "DESTROY_VOLUMES",
            OperatorCall::MarkAgentGone { .. } => "MARK_AGENT_GONE",
            OperatorCall::Subscribe => "SUBSCRIBE",
        }
    }

    /// True for calls that only read state.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            OperatorCall::GetHealth
                | OperatorCall::GetVersion
                | OperatorCall::GetFlags
                | OperatorCall::GetState
                | OperatorCall::GetAgents
                | OperatorCall::GetFrameworks
                | OperatorCall::GetTasks
                | OperatorCall::GetRoles
                | OperatorCall::GetMaintenanceSchedule
                | OperatorCall::GetMaintenanceStatus
                | OperatorCall::GetQuota
                | OperatorCall::GetWeights
                | OperatorCall::Subscribe
        )
    }
}

/// Operator API response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorResponse {
    Health { healthy: bool },
    Version { version: String },
    Flags { flags: serde_json::Value },
    State { state: StateSnapshot },
    Agents { agents: Vec<AgentSnapshot> },
    Frameworks {
        frameworks: Vec<FrameworkSnapshot>,
        completed_frameworks: Vec<FrameworkSnapshot>,
    },
    Tasks { tasks: Vec<TaskSnapshot> },
    Roles { roles: Vec<RoleSnapshot> },
    MaintenanceSchedule { schedule: MaintenanceSchedule },
    MaintenanceStatus { statuses: Vec<MachineStatus> },
    Quota { quotas: Vec<QuotaInfo> },
    Weights { weights: Vec<(String, f64)> },
    /// The operator is subscribed; events follow on the stream.
    Subscribed { stream_id: StreamId },
    /// Mutation applied, no payload.
    Ack,
}

/// Master-level events streamed to operator subscribers, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MasterEvent {
    AgentAdded {
        agent: AgentInfo,
    },
    AgentRemoved {
        agent_id: AgentId,
    },
    FrameworkAdded {
        framework_id: FrameworkId,
        framework: FrameworkInfo,
    },
    FrameworkUpdated {
        framework_id: FrameworkId,
        framework: FrameworkInfo,
    },
    FrameworkRemoved {
        framework_id: FrameworkId,
    },
    TaskAdded {
        framework_id: FrameworkId,
        task: TaskInfo,
    },
    TaskUpdated {
        framework_id: FrameworkId,
        task_id: TaskId,
        state: TaskState,
    },
    Heartbeat,
}
