//! The allocator seam.
//!
//! The allocator decides how free resources are offered to frameworks; the
//! master only informs it of cluster changes and executes its decisions.
//! Decisions flow back asynchronously through an [`AllocatorSink`]: the
//! allocator posts offers, the master validates them against live state on
//! its own actor turn. The allocation algorithm itself is out of scope;
//! [`ManualAllocator`] is a deterministic stand-in driven explicitly,
//! which is exactly what the end-to-end tests need.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use crate::config::MasterConfig;
use crate::event::Event;
use flotilla_model::{
    AgentCapability, AgentId, AgentInfo, Filters, FrameworkId, FrameworkInfo, Operation,
    OperationKind, ResourceRequest, Resources, Unavailability,
};

/// Channel the allocator uses to deliver decisions to the master.
#[derive(Debug, Clone)]
pub struct AllocatorSink {
    events: mpsc::UnboundedSender<Event>,
}

impl AllocatorSink {
    pub(crate) fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }

    /// Offer resources on the given agents to a framework.
    pub fn offer(&self, framework_id: FrameworkId, offers: HashMap<AgentId, Resources>) {
        let _ = self.events.send(Event::Offers {
            framework_id,
            offers,
        });
    }

    /// Ask a framework to vacate the given agents ahead of maintenance.
    pub fn inverse_offer(
        &self,
        framework_id: FrameworkId,
        agents: HashMap<AgentId, Unavailability>,
    ) {
        let _ = self.events.send(Event::InverseOffers {
            framework_id,
            agents,
        });
    }
}

/// The allocator contract.
///
/// All methods are invoked synchronously from the master actor; anything
/// slow belongs on the allocator's own tasks, with results delivered
/// through the sink.
pub trait Allocator: Send + 'static {
    /// Called once when the master becomes leader.
    fn initialize(&mut self, config: &MasterConfig, sink: AllocatorSink);

    fn add_framework(
        &mut self,
        framework_id: &FrameworkId,
        info: &FrameworkInfo,
        used: &HashMap<AgentId, Resources>,
        active: bool,
    );
    fn remove_framework(&mut self, framework_id: &FrameworkId);
    fn activate_framework(&mut self, framework_id: &FrameworkId);
    fn deactivate_framework(&mut self, framework_id: &FrameworkId);

    #[allow(clippy::too_many_arguments)]
    fn add_agent(
        &mut self,
        agent_id: &AgentId,
        info: &AgentInfo,
        capabilities: &[AgentCapability],
        unavailability: Option<Unavailability>,
        total: &Resources,
        used: &HashMap<FrameworkId, Resources>,
    );
    fn remove_agent(&mut self, agent_id: &AgentId);
    fn activate_agent(&mut self, agent_id: &AgentId);
    fn deactivate_agent(&mut self, agent_id: &AgentId);
    /// The agent's total resources changed (reservation or volume applied).
    fn update_agent(&mut self, agent_id: &AgentId, total: &Resources);
    fn update_unavailability(&mut self, agent_id: &AgentId, unavailability: Option<Unavailability>);

    fn add_role(&mut self, role: &str);
    fn remove_role(&mut self, role: &str);
    fn update_weights(&mut self, weights: &[(String, f64)]);
    fn set_quota(&mut self, role: &str, guarantee: &Resources);
    fn remove_quota(&mut self, role: &str);

    /// Inform the allocator of operations applied in an accept.
    fn update_allocation(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        operations: &[Operation],
    );
    /// Return unused offer remnants (or a released task's resources).
    fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: &Resources,
        filters: Option<Filters>,
    );

    fn suppress_offers(&mut self, framework_id: &FrameworkId);
    fn revive_offers(&mut self, framework_id: &FrameworkId);

    /// Advisory resource requests, forwarded verbatim.
    fn request_resources(&mut self, _framework_id: &FrameworkId, _requests: &[ResourceRequest]) {}
}

/// One recorded allocator invocation, for assertions and debugging.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocatorCall {
    AddFramework(FrameworkId),
    RemoveFramework(FrameworkId),
    ActivateFramework(FrameworkId),
    DeactivateFramework(FrameworkId),
    AddAgent(AgentId, Resources),
    RemoveAgent(AgentId),
    ActivateAgent(AgentId),
    DeactivateAgent(AgentId),
    UpdateAgent(AgentId, Resources),
    UpdateUnavailability(AgentId, Option<Unavailability>),
    AddRole(String),
    RemoveRole(String),
    UpdateWeights(Vec<(String, f64)>),
    SetQuota(String, Resources),
    RemoveQuota(String),
    UpdateAllocation(FrameworkId, AgentId, Vec<OperationKind>),
    RecoverResources(FrameworkId, AgentId, Resources, Option<Filters>),
    SuppressOffers(FrameworkId),
    ReviveOffers(FrameworkId),
    RequestResources(FrameworkId, usize),
}

#[derive(Debug, Default)]
struct ManualAllocatorState {
    sink: Option<AllocatorSink>,
    calls: Vec<AllocatorCall>,
}

/// Deterministic allocator driven from outside.
///
/// Records every invocation and makes no decisions of its own; offers are
/// injected through [`ManualAllocatorHandle::offer`]. Tests and manual
/// scheduling setups use this to script exact offer sequences.
#[derive(Debug, Default)]
pub struct ManualAllocator {
    state: Arc<Mutex<ManualAllocatorState>>,
}

impl ManualAllocator {
    /// Create an allocator plus the handle that drives it.
    pub fn new() -> (Self, ManualAllocatorHandle) {
        let state = Arc::new(Mutex::new(ManualAllocatorState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ManualAllocatorHandle { state },
        )
    }

    fn record(&self, call: AllocatorCall) {
        self.state.lock().calls.push(call);
    }
}

/// Driving handle for [`ManualAllocator`].
#[derive(Debug, Clone)]
pub struct ManualAllocatorHandle {
    state: Arc<Mutex<ManualAllocatorState>>,
}

impl ManualAllocatorHandle {
    /// Inject an offer decision, as the allocation algorithm would.
    ///
    /// Returns false if the allocator has not been initialized yet.
    pub fn offer(&self, framework_id: FrameworkId, offers: HashMap<AgentId, Resources>) -> bool {
        match &self.state.lock().sink {
            Some(sink) => {
                sink.offer(framework_id, offers);
                true
            }
            None => false,
        }
    }

    /// Inject an inverse offer decision.
    pub fn inverse_offer(
        &self,
        framework_id: FrameworkId,
        agents: HashMap<AgentId, Unavailability>,
    ) -> bool {
        match &self.state.lock().sink {
            Some(sink) => {
                sink.inverse_offer(framework_id, agents);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every recorded invocation, in order.
    pub fn calls(&self) -> Vec<AllocatorCall> {
        self.state.lock().calls.clone()
    }

    /// All resources recovered so far, keyed by (framework, agent).
    pub fn recovered(&self) -> Vec<(FrameworkId, AgentId, Resources)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                AllocatorCall::RecoverResources(f, a, r, _) => {
                    Some((f.clone(), a.clone(), r.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

impl Allocator for ManualAllocator {
    fn initialize(&mut self, _config: &MasterConfig, sink: AllocatorSink) {
        self.state.lock().sink = Some(sink);
    }

    fn add_framework(
        &mut self,
        framework_id: &FrameworkId,
        _info: &FrameworkInfo,
        _used: &HashMap<AgentId, Resources>,
        _active: bool,
    ) {
        self.record(AllocatorCall::AddFramework(framework_id.clone()));
    }

    fn remove_framework(&mut self, framework_id: &FrameworkId) {
        self.record(AllocatorCall::RemoveFramework(framework_id.clone()));
    }

    fn activate_framework(&mut self, framework_id: &FrameworkId) {
        self.record(AllocatorCall::ActivateFramework(framework_id.clone()));
    }

    fn deactivate_framework(&mut self, framework_id: &FrameworkId) {
        self.record(AllocatorCall::DeactivateFramework(framework_id.clone()));
    }

    fn add_agent(
        &mut self,
        agent_id: &AgentId,
        _info: &AgentInfo,
        _capabilities: &[AgentCapability],
        _unavailability: Option<Unavailability>,
        total: &Resources,
        _used: &HashMap<FrameworkId, Resources>,
    ) {
        self.record(AllocatorCall::AddAgent(agent_id.clone(), total.clone()));
    }

    fn remove_agent(&mut self, agent_id: &AgentId) {
        self.record(AllocatorCall::RemoveAgent(agent_id.clone()));
    }

    fn activate_agent(&mut self, agent_id: &AgentId) {
        self.record(AllocatorCall::ActivateAgent(agent_id.clone()));
    }

    fn deactivate_agent(&mut self, agent_id: &AgentId) {
        self.record(AllocatorCall::DeactivateAgent(agent_id.clone()));
    }

    fn update_agent(&mut self, agent_id: &AgentId, total: &Resources) {
        self.record(AllocatorCall::UpdateAgent(agent_id.clone(), total.clone()));
    }

    fn update_unavailability(
        &mut self,
        agent_id: &AgentId,
        unavailability: Option<Unavailability>,
    ) {
        self.record(AllocatorCall::UpdateUnavailability(
            agent_id.clone(),
            unavailability,
        ));
    }

    fn add_role(&mut self, role: &str) {
        self.record(AllocatorCall::AddRole(role.to_owned()));
    }

    fn remove_role(&mut self, role: &str) {
        self.record(AllocatorCall::RemoveRole(role.to_owned()));
    }

    fn update_weights(&mut self, weights: &[(String, f64)]) {
        self.record(AllocatorCall::UpdateWeights(weights.to_vec()));
    }

    fn set_quota(&mut self, role: &str, guarantee: &Resources) {
        self.record(AllocatorCall::SetQuota(role.to_owned(), guarantee.clone()));
    }

    fn remove_quota(&mut self, role: &str) {
        self.record(AllocatorCall::RemoveQuota(role.to_owned()));
    }

    fn update_allocation(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        operations: &[Operation],
    ) {
        self.record(AllocatorCall::UpdateAllocation(
            framework_id.clone(),
            agent_id.clone(),
            operations.iter().map(Operation::kind).collect(),
        ));
    }

    fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: &Resources,
        filters: Option<Filters>,
    ) {
        self.record(AllocatorCall::RecoverResources(
            framework_id.clone(),
            agent_id.clone(),
            resources.clone(),
            filters,
        ));
    }

    fn suppress_offers(&mut self, framework_id: &FrameworkId) {
        self.record(AllocatorCall::SuppressOffers(framework_id.clone()));
    }

    fn revive_offers(&mut self, framework_id: &FrameworkId) {
        self.record(AllocatorCall::ReviveOffers(framework_id.clone()));
    }

    fn request_resources(&mut self, framework_id: &FrameworkId, requests: &[ResourceRequest]) {
        self.record(AllocatorCall::RequestResources(
            framework_id.clone(),
            requests.len(),
        ));
    }
}
