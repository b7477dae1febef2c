//! # flotilla-model - Cluster Data Model
//!
//! Foundation types shared by the flotilla master and registrar: stable
//! identifiers, the resource algebra with offer operations, descriptors for
//! agents, frameworks, tasks and machines, and the wire-level call/event
//! surface. This crate performs no I/O; everything here is pure data and
//! pure transformations.
//!
//! # Module Organization
//!
//! - [`ids`] - Newtype identifiers (agent, framework, offer, task, machine)
//! - [`resources`] - Resource bundles, reservations, persistent volumes
//! - [`operations`] - Offer operations and the pure `apply` transformation
//! - [`task`] - Task state machine, task/executor descriptors, status
//! - [`agent`] - Agent descriptor and capabilities
//! - [`framework`] - Framework descriptor
//! - [`machine`] - Machine identity and maintenance primitives
//! - [`messages`] - Scheduler/agent/operator calls and master events
//! - [`snapshot`] - Operator-facing read models

pub mod agent;
pub mod framework;
pub mod ids;
pub mod machine;
pub mod messages;
pub mod operations;
pub mod resources;
pub mod snapshot;
pub mod task;

// Re-export commonly used types
pub use agent::{AgentCapability, AgentInfo};
pub use framework::FrameworkInfo;
pub use ids::{
    AgentId, ExecutorId, FrameworkId, InverseOfferId, MachineId, MasterId, OfferId, PeerAddr,
    StatusUuid, StreamId, TaskId,
};
pub use machine::{MachineMode, MaintenanceSchedule, MaintenanceWindow, Unavailability};
pub use messages::{
    AgentCall, AgentMessage, Filters, InverseOffer, MasterEvent, Offer, OperatorCall,
    OperatorResponse, ReconcileTask, ResourceRequest, SchedulerCall, SchedulerEvent, StatusUpdate,
};
pub use operations::{Operation, OperationKind};
pub use resources::{Resource, ResourceError, Resources, Value, Volume};
pub use snapshot::{
    AgentSnapshot, FrameworkSnapshot, InverseOfferState, InverseOfferStatus, MachineStatus,
    QuotaInfo, RoleSnapshot, StateSnapshot, TaskSnapshot,
};
pub use task::{AgentTask, ExecutorInfo, TaskInfo, TaskState, TaskStatus};
