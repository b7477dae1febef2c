//! Operator-facing read models.
//!
//! Snapshots are plain serializable projections of master state. Offered
//! resources are exposed per agent only; range kinds are never summed
//! across agents.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::agent::AgentInfo;
use crate::framework::FrameworkInfo;
use crate::ids::{AgentId, FrameworkId, MachineId, MasterId, OfferId, TaskId};
use crate::machine::{MachineMode, Unavailability};
use crate::resources::Resources;
use crate::task::TaskState;

/// One live or unreachable agent as seen by the operator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent: AgentInfo,
    pub version: String,
    pub connected: bool,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub reregistered_at: Option<DateTime<Utc>>,
    pub total: Resources,
    pub checkpointed: Resources,
    /// Used resources partitioned by framework.
    pub used: Vec<(FrameworkId, Resources)>,
    /// Resources currently promised in outstanding offers on this agent.
    pub offered: Resources,
}

/// One live or completed framework as seen by the operator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkSnapshot {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub connected: bool,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub reregistered_at: Option<DateTime<Utc>>,
    /// Used resources partitioned by agent.
    pub used: Vec<(AgentId, Resources)>,
    pub offers: Vec<OfferId>,
    /// The bounded ring of finished tasks, oldest first.
    pub completed_tasks: Vec<TaskSnapshot>,
}

/// One task as seen by the operator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub name: String,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub state: TaskState,
    pub resources: Resources,
}

/// One role with its weight, quota, and subscribed frameworks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSnapshot {
    pub name: String,
    pub weight: f64,
    pub quota: Option<Resources>,
    pub frameworks: Vec<FrameworkId>,
}

/// A role's guaranteed resource minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub role: String,
    pub guarantee: Resources,
}

/// A framework's answer to an inverse offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverseOfferState {
    /// The framework agreed to vacate in time.
    Accepted,
    /// The framework refused; maintenance may proceed regardless.
    Declined,
    /// No answer yet.
    Pending,
}

/// Per-framework inverse offer status for one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOfferStatus {
    pub framework_id: FrameworkId,
    pub state: InverseOfferState,
    pub updated_at: DateTime<Utc>,
}

/// Maintenance view of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub machine: MachineId,
    pub mode: MachineMode,
    pub unavailability: Option<Unavailability>,
    pub inverse_offer_statuses: Vec<InverseOfferStatus>,
}

/// The whole-master state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub master_id: MasterId,
    pub elected_at: DateTime<Utc>,
    pub agents: Vec<AgentSnapshot>,
    /// Agents currently in the unreachable registry list.
    pub unreachable_agents: Vec<(AgentId, DateTime<Utc>)>,
    pub frameworks: Vec<FrameworkSnapshot>,
    pub completed_frameworks: Vec<FrameworkSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
}
