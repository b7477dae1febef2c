//! The master actor.
//!
//! One cooperative actor owns all master state and serially processes
//! events from one queue. Handlers never block: work that must wait
//! (registry commits, authentication, authorization) is spawned, and its
//! completion re-enters the queue as a continuation event that re-validates
//! everything before acting. There is no shared mutation across threads.
//!
//! Handler implementations are split by concern:
//!
//! - [`agents`] - agent lifecycle (§ registration, unreachability, removal)
//! - [`frameworks`] - framework lifecycle (subscribe, failover, teardown)
//! - [`offers`] - the offer/accept pipeline
//! - [`tasks`] - status updates, acknowledgements, reconciliation
//! - [`operator`] - operator API dispatch
//! - [`subscribers`] - master event fan-out

pub(crate) mod agents;
pub(crate) mod frameworks;
pub(crate) mod offers;
pub(crate) mod operator;
pub(crate) mod subscribers;
pub(crate) mod tasks;

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// Layer 3: Internal module imports
use crate::allocator::{Allocator, AllocatorSink};
use crate::auth::{Action, AuthTracker, Authenticator, AuthorizationRequest, Authorizer};
use crate::config::MasterConfig;
use crate::error::MasterError;
use crate::event::{
    AgentConn, Event, OperatorReply, RegistryIntent, SchedulerConn,
};
use crate::limiter::{LimitDecision, RateLimiters, TokenBucket};
use crate::roster::{AgentRoster, FrameworkRoster, MachineRoster, OfferLedger, RoleTable};
use flotilla_model::{
    AgentCall, AgentId, FrameworkId, MasterId, OperatorCall, PeerAddr, SchedulerCall,
    SchedulerEvent, StatusUuid, TaskId,
};
use flotilla_registrar::Registrar;

use self::subscribers::Subscribers;

/// Where the actor ended up when `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MasterState {
    Leading,
    Abdicated,
    Stopped,
}

/// Plain counters; gauge plumbing is out of scope.
#[derive(Debug, Default)]
pub struct MasterMetrics {
    /// Framework calls dropped by the rate limiter.
    pub dropped_calls: u64,
    /// Status updates processed.
    pub status_updates: u64,
    /// Acknowledgements that matched no pending update.
    pub invalid_acks: u64,
}

/// Cheap cloneable handle for injecting events into the master actor.
///
/// Transports hand inbound calls to the master through this; tests drive
/// the whole master through it.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MasterHandle {
    /// Deliver a framework call arriving over `conn`.
    pub fn scheduler_call(&self, conn: SchedulerConn, call: SchedulerCall) {
        let _ = self.tx.send(Event::Scheduler { conn, call });
    }

    /// Deliver an agent call arriving over `conn`.
    pub fn agent_call(&self, conn: AgentConn, call: AgentCall) {
        let _ = self.tx.send(Event::Agent { conn, call });
    }

    /// Signal that a scheduler transport closed.
    pub fn scheduler_disconnected(&self, peer: PeerAddr) {
        let _ = self.tx.send(Event::SchedulerDisconnected { peer });
    }

    /// Signal that an agent transport closed.
    pub fn agent_disconnected(&self, peer: PeerAddr) {
        let _ = self.tx.send(Event::AgentDisconnected { peer });
    }

    /// Report an external health check failure for an agent.
    pub fn agent_health_check_failed(&self, agent_id: AgentId) {
        let _ = self.tx.send(Event::AgentHealthCheckFailed { agent_id });
    }

    /// Issue an operator API call and await its reply.
    ///
    /// Because the actor processes events in order, awaiting a read-only
    /// call is also a barrier: every event injected before it has been
    /// fully handled once it returns.
    pub async fn operator_call(
        &self,
        principal: Option<String>,
        call: OperatorCall,
    ) -> Result<OperatorReply, MasterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Operator {
                principal,
                call,
                reply: reply_tx,
            })
            .map_err(|_| MasterError::NotRunning)?;
        reply_rx.await.map_err(|_| MasterError::NotRunning)
    }

    /// Stop the actor.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// The master: the central authority mediating between agents and
/// frameworks, backed by the durable registry and steered by the
/// allocator.
pub struct Master<A, R, Z, N>
where
    A: Allocator,
    R: Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    pub(crate) config: MasterConfig,
    pub(crate) id: MasterId,
    pub(crate) elected_at: DateTime<Utc>,

    pub(crate) allocator: A,
    pub(crate) registrar: Arc<R>,
    pub(crate) authorizer: Arc<Z>,
    pub(crate) authenticator: Arc<N>,

    rx: mpsc::UnboundedReceiver<Event>,
    pub(crate) tx: mpsc::UnboundedSender<Event>,

    pub(crate) agents: AgentRoster,
    pub(crate) frameworks: FrameworkRoster,
    pub(crate) offers: OfferLedger,
    pub(crate) machines: MachineRoster,
    pub(crate) roles: RoleTable,

    pub(crate) limiters: RateLimiters,
    pub(crate) removal_limiter: Option<TokenBucket>,
    pub(crate) auth: AuthTracker,
    pub(crate) subscribers: Subscribers,

    /// Status updates forwarded to frameworks and awaiting acknowledgement.
    pub(crate) pending_acks: HashMap<(AgentId, FrameworkId, TaskId), StatusUuid>,
    /// Tasks remembered for agents that crossed into unreachable, consulted
    /// when such an agent comes back.
    pub(crate) unreachable_tasks: HashMap<AgentId, HashMap<FrameworkId, Vec<TaskId>>>,

    pub(crate) next_agent_seq: u64,
    pub(crate) next_framework_seq: u64,
    pub(crate) next_offer_seq: u64,
    pub(crate) next_inverse_offer_seq: u64,
    /// Global generation counter for connect/disconnect epochs.
    pub(crate) next_epoch: u64,

    pub(crate) state: MasterState,
    pub(crate) metrics: MasterMetrics,
    gc_task: Option<JoinHandle<()>>,
}

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    /// Create a master and its handle. The allocator is initialized
    /// immediately with a sink into the actor's queue.
    pub fn new(
        config: MasterConfig,
        mut allocator: A,
        registrar: R,
        authorizer: Z,
        authenticator: N,
    ) -> Result<(Self, MasterHandle), String> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        allocator.initialize(&config, AllocatorSink::new(tx.clone()));

        let master = Self {
            id: MasterId::new(),
            elected_at: Utc::now(),
            agents: AgentRoster::new(config.max_removed_agents),
            frameworks: FrameworkRoster::new(config.max_completed_frameworks),
            offers: OfferLedger::new(),
            machines: MachineRoster::new(),
            roles: RoleTable::new(config.weights.clone(), config.role_whitelist.clone()),
            limiters: RateLimiters::new(config.rate_limits.clone()),
            removal_limiter: config.agent_removal_limit.map(TokenBucket::new),
            auth: AuthTracker::new(),
            subscribers: Subscribers::new(),
            pending_acks: HashMap::new(),
            unreachable_tasks: HashMap::new(),
            next_agent_seq: 0,
            next_framework_seq: 0,
            next_offer_seq: 0,
            next_inverse_offer_seq: 0,
            next_epoch: 0,
            state: MasterState::Leading,
            metrics: MasterMetrics::default(),
            gc_task: None,
            allocator,
            registrar: Arc::new(registrar),
            authorizer: Arc::new(authorizer),
            authenticator: Arc::new(authenticator),
            rx,
            tx: tx.clone(),
            config,
        };
        Ok((master, MasterHandle { tx }))
    }

    /// Run the actor until shutdown or abdication.
    ///
    /// Recovers the registry first; failure to recover means the master
    /// cannot safely lead and abdicates immediately.
    pub async fn run(mut self) -> Result<(), MasterError> {
        match self.registrar.recover().await {
            Ok(registry) => self.install_recovered(registry),
            Err(error) => {
                error!(%error, "failed to recover registry, abdicating");
                return Err(MasterError::Abdicated);
            }
        }

        let gc_tx = self.tx.clone();
        let gc_interval = self.config.registry_gc_interval;
        self.gc_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_interval);
            ticker.tick().await; // immediate first tick is uninteresting
            loop {
                ticker.tick().await;
                if gc_tx.send(Event::RegistryGcTick).is_err() {
                    break;
                }
            }
        }));

        info!(master_id = %self.id, "master elected and recovered");

        while let Some(event) = self.rx.recv().await {
            if matches!(event, Event::Shutdown) {
                self.state = MasterState::Stopped;
                break;
            }
            self.handle(event);
            if self.state == MasterState::Abdicated {
                break;
            }
        }

        if let Some(gc) = self.gc_task.take() {
            gc.abort();
        }
        info!(
            master_id = %self.id,
            dropped_calls = self.metrics.dropped_calls,
            status_updates = self.metrics.status_updates,
            invalid_acks = self.metrics.invalid_acks,
            "master stopped"
        );
        match self.state {
            MasterState::Abdicated => Err(MasterError::Abdicated),
            _ => Ok(()),
        }
    }

    /// Install registry state at election time.
    fn install_recovered(&mut self, registry: flotilla_registrar::Registry) {
        for info in registry.admitted() {
            let Some(id) = info.id.clone() else {
                warn!("recovered agent without id, skipping");
                continue;
            };
            self.agents.recovered.insert(id.clone(), info.clone());
            self.post_after(
                self.config.agent_reregister_timeout,
                Event::AgentReregisterDeadline {
                    agent_id: id,
                    epoch: 0,
                },
            );
        }
        for (id, when) in registry.unreachable() {
            self.agents.unreachable.insert(id.clone(), *when);
        }
        debug!(
            recovered = self.agents.recovered.len(),
            unreachable = self.agents.unreachable.len(),
            "registry recovered"
        );
    }

    /// Serial event dispatch. Handlers are synchronous; anything that must
    /// wait re-enters the queue as a continuation.
    fn handle(&mut self, event: Event) {
        match event {
            Event::Scheduler { conn, call } => self.handle_scheduler_inbound(conn, call),
            Event::SchedulerReleased {
                conn,
                call,
                principal,
            } => {
                self.dispatch_scheduler_call(conn, call, principal.clone());
                self.post(Event::LimiterRelease { principal });
            }
            Event::SchedulerDisconnected { peer } => self.handle_scheduler_disconnected(peer),
            Event::Agent { conn, call } => self.handle_agent_call(conn, call),
            Event::AgentDisconnected { peer } => self.handle_agent_disconnected(peer),
            Event::AgentHealthCheckFailed { agent_id } => {
                self.handle_agent_health_check_failed(agent_id)
            }
            Event::Operator {
                principal,
                call,
                reply,
            } => self.handle_operator_call(principal, call, reply),
            Event::Offers {
                framework_id,
                offers,
            } => self.handle_allocator_offers(framework_id, offers),
            Event::InverseOffers {
                framework_id,
                agents,
            } => self.handle_allocator_inverse_offers(framework_id, agents),
            Event::Authenticated {
                peer,
                generation,
                result,
            } => self.handle_authenticated(peer, generation, result),
            Event::AuthenticationTimedOut { peer, generation } => {
                self.handle_authentication_timed_out(peer, generation)
            }
            Event::SubscribeAuthorized {
                conn,
                principal,
                framework,
                framework_id,
                result,
            } => self.handle_subscribe_authorized(conn, principal, framework, framework_id, result),
            Event::TeardownAuthorized {
                framework_id,
                result,
            } => self.handle_teardown_authorized(framework_id, result),
            Event::AcceptAuthorized {
                framework_id,
                agent_id,
                offered,
                operations,
                filters,
            } => self.handle_accept_authorized(framework_id, agent_id, offered, operations, filters),
            Event::OperatorAuthorized {
                principal,
                call,
                reply,
                result,
            } => self.handle_operator_authorized(principal, call, reply, result),
            Event::RegistryCommitted { intent, result } => {
                self.handle_registry_committed(intent, result)
            }
            Event::OfferExpired { offer_id } => self.handle_offer_expired(offer_id),
            Event::FrameworkFailoverExpired {
                framework_id,
                epoch,
            } => self.handle_framework_failover_expired(framework_id, epoch),
            Event::AgentReregisterDeadline { agent_id, epoch } => {
                self.handle_agent_reregister_deadline(agent_id, epoch)
            }
            Event::RegistryGcTick => self.handle_registry_gc_tick(),
            Event::LimiterRelease { principal } => {
                self.limiters.release(principal.as_deref());
            }
            Event::Shutdown => self.state = MasterState::Stopped,
        }
    }

    // -- inbound framework call gating -----------------------------------

    /// Authentication and rate limiting gate for framework calls.
    fn handle_scheduler_inbound(&mut self, conn: SchedulerConn, call: SchedulerCall) {
        let peer = conn.peer.clone();
        let principal = match self.auth.principal(&peer) {
            Some(Some(principal)) => Some(principal.clone()),
            Some(None) => self.claimed_principal(&call),
            None => {
                if self.config.authentication_required {
                    self.start_authentication(peer, Event::Scheduler { conn, call });
                    return;
                }
                self.claimed_principal(&call)
            }
        };

        match self
            .limiters
            .acquire(principal.as_deref(), tokio::time::Instant::now())
        {
            LimitDecision::Admit => {
                self.dispatch_scheduler_call(conn, call, principal.clone());
                self.post(Event::LimiterRelease { principal });
            }
            LimitDecision::Defer(wait) => {
                debug!(peer = %conn.peer, call = call.name(), ?wait, "rate limited, deferring");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = tx.send(Event::SchedulerReleased {
                        conn,
                        call,
                        principal,
                    });
                });
            }
            LimitDecision::Drop => {
                self.metrics.dropped_calls += 1;
                warn!(peer = %conn.peer, call = call.name(), "rate limit capacity exceeded");
                conn.send(SchedulerEvent::Error {
                    message: format!(
                        "rate limit capacity exceeded for principal {}",
                        principal.as_deref().unwrap_or("(none)")
                    ),
                });
            }
        }
    }

    /// Kick off an authentication attempt, queueing the triggering event.
    fn start_authentication(&mut self, peer: PeerAddr, event: Event) {
        if self.auth.is_pending(&peer) {
            if let Err(event) = self.auth.enqueue(&peer, event) {
                // Raced with completion on this very turn; retry inline.
                self.handle(event);
            }
            return;
        }
        let generation = self.auth.begin(peer.clone(), event);
        self.post_after(
            self.config.authentication_timeout,
            Event::AuthenticationTimedOut {
                peer: peer.clone(),
                generation,
            },
        );
        let authenticator = Arc::clone(&self.authenticator);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = authenticator.authenticate(&peer).await;
            let _ = tx.send(Event::Authenticated {
                peer,
                generation,
                result,
            });
        });
    }

    /// Compensating action for a slow authenticator: refuse the queued
    /// calls. A completion arriving later is stale and ignored.
    fn handle_authentication_timed_out(&mut self, peer: PeerAddr, generation: u64) {
        let Some(queued) = self.auth.complete(&peer, generation, None) else {
            return;
        };
        warn!(%peer, "authentication timed out");
        self.refuse_queued(queued, "authentication timed out");
    }

    fn handle_authenticated(
        &mut self,
        peer: PeerAddr,
        generation: u64,
        result: Result<Option<String>, crate::auth::AuthenticationError>,
    ) {
        let cache = match &result {
            Ok(principal) => Some(principal.clone()),
            Err(_) => None,
        };
        let Some(queued) = self.auth.complete(&peer, generation, cache) else {
            debug!(%peer, "stale authentication completion discarded");
            return;
        };
        match result {
            Ok(Some(_)) => {
                for event in queued {
                    self.handle(event);
                }
            }
            Ok(None) => {
                // The peer proved no identity; with authentication required
                // its calls are refused, not processed anonymously.
                self.refuse_queued(queued, "authentication required");
            }
            Err(error) => {
                warn!(%peer, %error, "authentication backend failure");
                self.refuse_queued(queued, "authentication unavailable");
            }
        }
    }

    fn refuse_queued(&mut self, queued: Vec<Event>, message: &str) {
        for event in queued {
            if let Event::Scheduler { conn, call } = event {
                debug!(peer = %conn.peer, call = call.name(), message, "refusing call");
                conn.send(SchedulerEvent::Error {
                    message: message.to_owned(),
                });
            }
        }
    }

    /// The principal a call claims, used when the connection carries no
    /// authenticated identity.
    fn claimed_principal(&self, call: &SchedulerCall) -> Option<String> {
        if let SchedulerCall::Subscribe { framework, .. } = call {
            return framework.principal.clone();
        }
        call.framework_id()
            .and_then(|id| self.frameworks.get(id))
            .and_then(|framework| framework.principal().map(str::to_owned))
    }

    /// Validated dispatch of a gated framework call.
    fn dispatch_scheduler_call(
        &mut self,
        conn: SchedulerConn,
        call: SchedulerCall,
        principal: Option<String>,
    ) {
        match call {
            SchedulerCall::Subscribe {
                framework,
                framework_id,
            } => self.handle_subscribe(conn, framework, framework_id, principal),
            SchedulerCall::Teardown { framework_id } => {
                self.handle_teardown(conn, framework_id, principal)
            }
            SchedulerCall::Accept {
                framework_id,
                offer_ids,
                operations,
                filters,
            } => self.handle_accept(conn, framework_id, offer_ids, operations, filters),
            SchedulerCall::Decline {
                framework_id,
                offer_ids,
                filters,
            } => self.handle_accept(conn, framework_id, offer_ids, Vec::new(), filters),
            SchedulerCall::AcceptInverseOffers {
                framework_id,
                inverse_offer_ids,
            } => self.handle_inverse_offer_answer(conn, framework_id, inverse_offer_ids, true),
            SchedulerCall::DeclineInverseOffers {
                framework_id,
                inverse_offer_ids,
            } => self.handle_inverse_offer_answer(conn, framework_id, inverse_offer_ids, false),
            SchedulerCall::Revive { framework_id } => self.handle_revive(conn, framework_id),
            SchedulerCall::Suppress { framework_id } => self.handle_suppress(conn, framework_id),
            SchedulerCall::Kill {
                framework_id,
                task_id,
                agent_id,
            } => self.handle_kill(conn, framework_id, task_id, agent_id),
            SchedulerCall::Shutdown {
                framework_id,
                executor_id,
                agent_id,
            } => self.handle_shutdown_executor(conn, framework_id, executor_id, agent_id),
            SchedulerCall::Acknowledge {
                framework_id,
                agent_id,
                task_id,
                uuid,
            } => self.handle_acknowledge(conn, framework_id, agent_id, task_id, uuid),
            SchedulerCall::Reconcile {
                framework_id,
                tasks,
            } => self.handle_reconcile(conn, framework_id, tasks),
            SchedulerCall::Message {
                framework_id,
                agent_id,
                executor_id,
                data,
            } => self.handle_framework_to_executor(conn, framework_id, agent_id, executor_id, data),
            SchedulerCall::Request {
                framework_id,
                requests,
            } => self.handle_request(conn, framework_id, requests),
        }
    }

    // -- shared helpers --------------------------------------------------

    /// Enqueue an event at the back of the actor's own queue.
    pub(crate) fn post(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Fire an event after a delay. The timer never cancels anything; the
    /// handler it wakes performs a generation check and compensates.
    pub(crate) fn post_after(&self, delay: Duration, event: Event) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    /// Submit a registry mutation; its commit re-enters as
    /// [`Event::RegistryCommitted`].
    pub(crate) fn submit_registry(&self, intent: RegistryIntent, op: flotilla_registrar::RegistryOperation) {
        let registrar = Arc::clone(&self.registrar);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = registrar.apply(op).await;
            let _ = tx.send(Event::RegistryCommitted { intent, result });
        });
    }

    /// Submit one authorization request; the continuation is built by the
    /// caller from the result.
    pub(crate) fn submit_authorization<F>(&self, request: AuthorizationRequest, continuation: F)
    where
        F: FnOnce(Result<bool, crate::auth::AuthorizationError>) -> Event + Send + 'static,
    {
        let authorizer = Arc::clone(&self.authorizer);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(request).await;
            let _ = tx.send(continuation(result));
        });
    }

    /// Build an authorization request for a principal-action pair.
    pub(crate) fn authorization(principal: Option<String>, action: Action) -> AuthorizationRequest {
        AuthorizationRequest::new(principal, action)
    }

    pub(crate) fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Stop acting as leader. State may be stale from the cluster's point
    /// of view; a fresh election must re-recover from the registry.
    pub(crate) fn abdicate(&mut self, why: &str) {
        error!(master_id = %self.id, why, "abdicating leadership");
        self.state = MasterState::Abdicated;
    }

}
