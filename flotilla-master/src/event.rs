//! The master actor's event type.
//!
//! Everything the master reacts to is one [`Event`] drawn from a single
//! queue: inbound calls, transport exits, allocator callbacks, completions
//! of suspended work (authentication, authorization, registry commits) and
//! timers. Handlers run to their first suspension point, hand the rest of
//! their context to a spawned future, and that future finishes by posting
//! a continuation event carrying the context back.
//!
//! Continuations never carry pointers into master state: they carry ids
//! and payloads, and the handler re-validates everything on resumption.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

// Layer 3: Internal module imports
use crate::auth::{AuthenticationError, AuthorizationError};
use crate::error::MasterError;
use flotilla_model::{
    AgentCall, AgentId, AgentInfo, AgentMessage, AgentTask, ExecutorInfo, Filters, FrameworkId,
    FrameworkInfo, MasterEvent, OfferId, Operation, OperatorCall, OperatorResponse, PeerAddr,
    Resources, SchedulerCall, SchedulerEvent, Unavailability,
};
use flotilla_registrar::RegistrarError;

/// How a framework is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Message-passing endpoint addressed by pid.
    Pid,
    /// Streaming HTTP connection; heartbeats are emitted on it.
    Http,
}

/// A framework-side connection: where events for this framework go.
#[derive(Debug, Clone)]
pub struct SchedulerConn {
    pub peer: PeerAddr,
    pub kind: ConnectionKind,
    pub sender: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerConn {
    /// Create a connection handle.
    pub fn new(
        peer: PeerAddr,
        kind: ConnectionKind,
        sender: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self { peer, kind, sender }
    }

    /// Best-effort send; a closed receiver means the peer is gone.
    pub fn send(&self, event: SchedulerEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// An agent-side connection: where messages for this agent go.
#[derive(Debug, Clone)]
pub struct AgentConn {
    pub peer: PeerAddr,
    pub sender: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentConn {
    /// Create a connection handle.
    pub fn new(peer: PeerAddr, sender: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self { peer, sender }
    }

    /// Best-effort send; a closed receiver means the agent is gone.
    pub fn send(&self, message: AgentMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Reply to an operator call, with the event stream attached for
/// subscribe calls.
#[derive(Debug)]
pub struct OperatorReply {
    pub response: Result<OperatorResponse, MasterError>,
    pub events: Option<mpsc::UnboundedReceiver<MasterEvent>>,
}

impl OperatorReply {
    pub(crate) fn of(response: Result<OperatorResponse, MasterError>) -> Self {
        Self {
            response,
            events: None,
        }
    }
}

/// Everything a re-registering agent reports about itself.
#[derive(Debug, Clone)]
pub struct Reregistration {
    pub checkpointed: Resources,
    pub executors: Vec<ExecutorInfo>,
    pub tasks: Vec<AgentTask>,
    pub frameworks: Vec<(FrameworkId, FrameworkInfo)>,
    pub completed_frameworks: Vec<FrameworkId>,
    pub version: String,
}

/// A registry mutation in flight, with the context needed to finish the
/// lifecycle transition once the commit lands.
#[derive(Debug)]
pub enum RegistryIntent {
    /// First registration: admit, then install and ack.
    Admit {
        info: AgentInfo,
        conn: AgentConn,
        checkpointed: Resources,
        version: String,
    },
    /// Re-registration of an unreachable (or garbage-collected) agent:
    /// mark reachable, then install and reconcile.
    Readmit {
        info: AgentInfo,
        conn: AgentConn,
        reregistration: Box<Reregistration>,
    },
    /// Agent went silent: durably mark unreachable, then drop it from the
    /// live roster.
    MarkUnreachable {
        info: AgentInfo,
        since: DateTime<Utc>,
    },
    /// Prune unreachable entries: registry GC (no reply) or an operator
    /// marking an unreachable agent gone.
    Prune {
        ids: HashSet<AgentId>,
        reply: Option<oneshot::Sender<OperatorReply>>,
    },
    /// Operator-requested removal: remove, then tombstone.
    Remove {
        info: AgentInfo,
        reply: Option<oneshot::Sender<OperatorReply>>,
    },
}

impl RegistryIntent {
    /// Short intent name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryIntent::Admit { .. } => "ADMIT",
            RegistryIntent::Readmit { .. } => "READMIT",
            RegistryIntent::MarkUnreachable { .. } => "MARK_UNREACHABLE",
            RegistryIntent::Prune { .. } => "PRUNE",
            RegistryIntent::Remove { .. } => "REMOVE",
        }
    }
}

/// One event on the master's queue.
#[derive(Debug)]
pub enum Event {
    // -- inbound traffic -------------------------------------------------
    /// A framework call from a connected scheduler.
    Scheduler {
        conn: SchedulerConn,
        call: SchedulerCall,
    },
    /// A framework call released from the rate limiter's deferral queue.
    SchedulerReleased {
        conn: SchedulerConn,
        call: SchedulerCall,
        principal: Option<String>,
    },
    /// A scheduler transport closed.
    SchedulerDisconnected { peer: PeerAddr },
    /// An agent call.
    Agent { conn: AgentConn, call: AgentCall },
    /// An agent transport closed.
    AgentDisconnected { peer: PeerAddr },
    /// An external health checker declared the agent unhealthy.
    AgentHealthCheckFailed { agent_id: AgentId },
    /// An operator API request.
    Operator {
        principal: Option<String>,
        call: OperatorCall,
        reply: oneshot::Sender<OperatorReply>,
    },

    // -- allocator callbacks ---------------------------------------------
    /// The allocator decided to offer resources to a framework.
    Offers {
        framework_id: FrameworkId,
        offers: HashMap<AgentId, Resources>,
    },
    /// The allocator asks a framework to vacate agents ahead of
    /// maintenance.
    InverseOffers {
        framework_id: FrameworkId,
        agents: HashMap<AgentId, Unavailability>,
    },

    // -- continuations ---------------------------------------------------
    /// An authentication attempt finished.
    Authenticated {
        peer: PeerAddr,
        generation: u64,
        result: Result<Option<String>, AuthenticationError>,
    },
    /// An authentication attempt stayed in flight past its deadline. The
    /// attempt is not cancelled; its late completion is discarded by
    /// generation.
    AuthenticationTimedOut { peer: PeerAddr, generation: u64 },
    /// Subscribe authorization finished.
    SubscribeAuthorized {
        conn: SchedulerConn,
        principal: Option<String>,
        framework: FrameworkInfo,
        framework_id: Option<FrameworkId>,
        result: Result<bool, AuthorizationError>,
    },
    /// Teardown authorization finished.
    TeardownAuthorized {
        framework_id: FrameworkId,
        result: Result<bool, AuthorizationError>,
    },
    /// Per-operation accept authorizations finished (gathered in parallel,
    /// applied in the framework's order).
    AcceptAuthorized {
        framework_id: FrameworkId,
        agent_id: AgentId,
        offered: Resources,
        operations: Vec<(Operation, Result<bool, AuthorizationError>)>,
        filters: Option<Filters>,
    },
    /// Operator call authorization finished.
    OperatorAuthorized {
        principal: Option<String>,
        call: OperatorCall,
        reply: oneshot::Sender<OperatorReply>,
        result: Result<bool, AuthorizationError>,
    },
    /// A registry commit finished.
    RegistryCommitted {
        intent: RegistryIntent,
        result: Result<bool, RegistrarError>,
    },

    // -- timers ----------------------------------------------------------
    /// An offer's expiration timer fired.
    OfferExpired { offer_id: OfferId },
    /// A framework's failover timer fired. Stale epochs are ignored.
    FrameworkFailoverExpired { framework_id: FrameworkId, epoch: u64 },
    /// A recovered or disconnected agent's re-registration window closed.
    /// Stale epochs are ignored.
    AgentReregisterDeadline { agent_id: AgentId, epoch: u64 },
    /// Periodic registry garbage collection.
    RegistryGcTick,
    /// A rate-limited call finished processing; free its capacity slot.
    LimiterRelease { principal: Option<String> },

    /// Stop the actor (lost leadership or shutdown).
    Shutdown,
}

impl Event {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Scheduler { .. } => "SCHEDULER",
            Event::SchedulerReleased { .. } => "SCHEDULER_RELEASED",
            Event::SchedulerDisconnected { .. } => "SCHEDULER_DISCONNECTED",
            Event::Agent { .. } => "AGENT",
            Event::AgentDisconnected { .. } => "AGENT_DISCONNECTED",
            Event::AgentHealthCheckFailed { .. } => "AGENT_HEALTH_CHECK_FAILED",
            Event::Operator { .. } => "OPERATOR",
            Event::Offers { .. } => "OFFERS",
            Event::InverseOffers { .. } => "INVERSE_OFFERS",
            Event::Authenticated { .. } => "AUTHENTICATED",
            Event::AuthenticationTimedOut { .. } => "AUTHENTICATION_TIMED_OUT",
            Event::SubscribeAuthorized { .. } => "SUBSCRIBE_AUTHORIZED",
            Event::TeardownAuthorized { .. } => "TEARDOWN_AUTHORIZED",
            Event::AcceptAuthorized { .. } => "ACCEPT_AUTHORIZED",
            Event::OperatorAuthorized { .. } => "OPERATOR_AUTHORIZED",
            Event::RegistryCommitted { .. } => "REGISTRY_COMMITTED",
            Event::OfferExpired { .. } => "OFFER_EXPIRED",
            Event::FrameworkFailoverExpired { .. } => "FRAMEWORK_FAILOVER_EXPIRED",
            Event::AgentReregisterDeadline { .. } => "AGENT_REREGISTER_DEADLINE",
            Event::RegistryGcTick => "REGISTRY_GC_TICK",
            Event::LimiterRelease { .. } => "LIMITER_RELEASE",
            Event::Shutdown => "SHUTDOWN",
        }
    }
}
