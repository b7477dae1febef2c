//! Agent lifecycle orchestration.
//!
//! Agents move `recovered -> (re)registering -> registered -> disconnected
//! -> unreachable -> removed`. Every durable transition is gated on a
//! registry commit; the in-memory roster changes only after the commit
//! lands. Conflicts on retried commits are treated as success where an
//! earlier attempt may have committed.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use chrono::Utc;
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use crate::allocator::Allocator;
use crate::auth::{Authenticator, Authorizer};
use crate::event::{AgentConn, Event, OperatorReply, RegistryIntent, Reregistration};
use crate::limiter::LimitDecision;
use crate::master::Master;
use crate::roster::frameworks::CompletedTask;
use crate::roster::{Agent, Task};
use flotilla_model::{
    AgentCall, AgentId, AgentInfo, AgentMessage, AgentTask, MachineMode, MasterEvent,
    OperatorResponse, Resources, SchedulerEvent, TaskState, TaskStatus,
};
use flotilla_registrar::{RegistrarError, RegistryOperation};

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: flotilla_registrar::Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    pub(crate) fn handle_agent_call(&mut self, conn: AgentConn, call: AgentCall) {
        match call {
            AgentCall::Register {
                agent,
                checkpointed,
                version,
            } => self.handle_register(conn, agent, checkpointed, version),
            AgentCall::Reregister {
                agent,
                checkpointed,
                executors,
                tasks,
                frameworks,
                completed_frameworks,
                version,
            } => self.handle_reregister(
                conn,
                agent,
                Reregistration {
                    checkpointed,
                    executors,
                    tasks,
                    frameworks,
                    completed_frameworks,
                    version,
                },
            ),
            AgentCall::StatusUpdate { update } => self.handle_status_update(update),
            AgentCall::ExitedExecutor {
                agent_id,
                framework_id,
                executor_id,
                status,
            } => self.handle_exited_executor(agent_id, framework_id, executor_id, status),
            AgentCall::FrameworkMessage {
                agent_id,
                framework_id,
                executor_id,
                data,
            } => self.handle_executor_to_framework(agent_id, framework_id, executor_id, data),
        }
    }

    // -- first registration ----------------------------------------------

    fn handle_register(
        &mut self,
        conn: AgentConn,
        info: AgentInfo,
        checkpointed: Resources,
        version: String,
    ) {
        if self.machines.mode(&info.machine_id()) == MachineMode::Down {
            warn!(hostname = %info.hostname, "refusing registration from a machine under maintenance");
            conn.send(AgentMessage::RegistrationRefused {
                message: "machine is down for maintenance".to_owned(),
            });
            return;
        }

        // Retried registration from an agent we already installed: resend
        // the ack rather than admitting twice.
        if let Some(existing) = self.agents.by_address(&conn.peer) {
            debug!(agent_id = %existing.id, "duplicate registration, resending ack");
            conn.send(AgentMessage::Registered {
                agent_id: existing.id.clone(),
            });
            return;
        }

        // An admission for this address is already in flight.
        if self.agents.registering.contains(&conn.peer) {
            debug!(peer = %conn.peer, "registration already in progress, ignoring");
            return;
        }

        let agent_id = AgentId::generate(&self.id, self.next_agent_seq);
        self.next_agent_seq += 1;
        let info = info.with_id(agent_id);

        self.agents.registering.insert(conn.peer.clone());
        self.submit_registry(
            RegistryIntent::Admit {
                info: info.clone(),
                conn,
                checkpointed,
                version,
            },
            RegistryOperation::Admit(info),
        );
    }

    // -- re-registration -------------------------------------------------

    fn handle_reregister(&mut self, conn: AgentConn, info: AgentInfo, rereg: Reregistration) {
        let Some(agent_id) = info.id.clone() else {
            warn!(peer = %conn.peer, "re-registration without an agent id, refusing");
            conn.send(AgentMessage::RegistrationRefused {
                message: "re-registration requires an agent id".to_owned(),
            });
            return;
        };

        // A removed agent re-registering is explicitly refused.
        if self.agents.removed.contains(&agent_id) {
            info!(%agent_id, "removed agent attempted re-registration, shutting it down");
            conn.send(AgentMessage::Shutdown {
                message: "agent has been removed".to_owned(),
            });
            return;
        }

        if self.machines.mode(&info.machine_id()) == MachineMode::Down {
            conn.send(AgentMessage::RegistrationRefused {
                message: "machine is down for maintenance".to_owned(),
            });
            return;
        }

        if self.agents.reregistering.contains(&agent_id) {
            debug!(%agent_id, "re-admission already in flight, ignoring");
            return;
        }

        if self.agents.contains(&agent_id) {
            // Known and live: the new connection wins, the old transport
            // is abandoned.
            self.rebind_agent(&agent_id, conn, info, rereg);
        } else if self.agents.unreachable.contains_key(&agent_id) {
            // Durably unreachable: re-admission must commit first.
            self.agents.reregistering.insert(agent_id);
            self.submit_registry(
                RegistryIntent::Readmit {
                    info: info.clone(),
                    conn,
                    reregistration: Box::new(rereg),
                },
                RegistryOperation::MarkReachable(info),
            );
        } else if self.agents.recovered.contains_key(&agent_id) {
            // Known from registry recovery; already admitted, no registry
            // round-trip needed.
            self.install_reregistered_agent(info, conn, rereg);
        } else if self.config.registry_strict {
            info!(%agent_id, "unknown agent refused under strict registry");
            conn.send(AgentMessage::Shutdown {
                message: "agent is unknown to the registry".to_owned(),
            });
        } else {
            // Entirely unknown (possibly garbage-collected). MarkReachable
            // admits it regardless, logging the oddity.
            self.agents.reregistering.insert(agent_id);
            self.submit_registry(
                RegistryIntent::Readmit {
                    info: info.clone(),
                    conn,
                    reregistration: Box::new(rereg),
                },
                RegistryOperation::MarkReachable(info),
            );
        }
    }

    /// An already-live agent re-registered (agent restart or transport
    /// replacement): the new connection wins, the old transport is
    /// abandoned, and the reported tasks are reconciled.
    fn rebind_agent(
        &mut self,
        agent_id: &AgentId,
        conn: AgentConn,
        info: AgentInfo,
        rereg: Reregistration,
    ) {
        let old_machine = self.agents.get(agent_id).map(|a| a.info.machine_id());
        let epoch = self.bump_epoch();
        self.agents.rebind(agent_id, conn);
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        let was_active = agent.active;
        agent.info = info;
        agent.connected = true;
        agent.active = true;
        agent.epoch = epoch;
        agent.reregistered_at = Some(Utc::now());
        agent.version = rereg.version.clone();
        let new_machine = agent.info.machine_id();
        let ack = AgentMessage::Reregistered {
            agent_id: agent_id.clone(),
        };
        agent.conn.send(ack);

        if old_machine.as_ref() != Some(&new_machine) {
            if let Some(old_machine) = old_machine {
                self.machines.untrack_agent(&old_machine, agent_id);
            }
            self.machines.track_agent(&new_machine, agent_id.clone());
        }
        if !was_active {
            self.allocator.activate_agent(agent_id);
        }
        self.adopt_recovered_frameworks(&rereg);
        self.reconcile_reported_tasks(agent_id, rereg.tasks);
    }

    /// Finish installing a re-registering agent once it is (back) in the
    /// admitted list.
    pub(crate) fn install_reregistered_agent(
        &mut self,
        info: AgentInfo,
        conn: AgentConn,
        rereg: Reregistration,
    ) {
        let Some(agent_id) = info.id.clone() else {
            return;
        };
        let epoch = self.bump_epoch();
        self.agents.recovered.remove(&agent_id);
        self.agents.unreachable.remove(&agent_id);

        let mut agent = Agent::new(
            agent_id.clone(),
            info.clone(),
            conn,
            rereg.checkpointed.clone(),
            rereg.version.clone(),
            epoch,
        );
        agent.reregistered_at = Some(Utc::now());

        for executor in &rereg.executors {
            let Some(framework_id) = executor.framework_id.clone() else {
                warn!(executor_id = %executor.executor_id, "reported executor without framework, skipping");
                continue;
            };
            agent.add_executor(framework_id, executor.clone());
        }

        self.machines.track_agent(&info.machine_id(), agent_id.clone());
        let unavailability = self
            .machines
            .get(&info.machine_id())
            .and_then(|m| m.unavailability);
        self.allocator.add_agent(
            &agent_id,
            &info,
            &info.capabilities,
            unavailability,
            &agent.total,
            agent.used(),
        );
        agent.conn.send(AgentMessage::Reregistered {
            agent_id: agent_id.clone(),
        });
        self.agents.insert(agent);

        self.adopt_recovered_frameworks(&rereg);
        self.reconcile_reported_tasks(&agent_id, rereg.tasks);

        self.subscribers
            .broadcast(MasterEvent::AgentAdded { agent: info });
        info!(%agent_id, "agent re-registered");
    }

    /// Frameworks reported by a re-registering agent that this master has
    /// never heard of are remembered until they re-subscribe.
    fn adopt_recovered_frameworks(&mut self, rereg: &Reregistration) {
        for (framework_id, framework_info) in &rereg.frameworks {
            if self.frameworks.contains(framework_id)
                || self.frameworks.is_completed(framework_id)
                || self.frameworks.recovered.contains_key(framework_id)
            {
                continue;
            }
            debug!(%framework_id, "recovered framework from agent report");
            self.frameworks
                .recovered
                .insert(framework_id.clone(), framework_info.clone());
        }
    }

    /// Reconcile the task lists: the agent's report is authoritative for
    /// the terminal/non-terminal distinction; tasks the master knows but
    /// the agent does not report are killed.
    pub(crate) fn reconcile_reported_tasks(&mut self, agent_id: &AgentId, reported: Vec<AgentTask>) {
        let remembered = self.unreachable_tasks.remove(agent_id).unwrap_or_default();
        let mut reported_ids: HashMap<_, HashSet<_>> = HashMap::new();

        for agent_task in reported {
            reported_ids
                .entry(agent_task.framework_id.clone())
                .or_default()
                .insert(agent_task.info.task_id.clone());
            self.adopt_reported_task(agent_id, agent_task);
        }

        // Tasks the master knew before the agent went away, now absent
        // from the report: issue kills so stragglers cannot linger.
        for (framework_id, task_ids) in remembered {
            for task_id in task_ids {
                let was_reported = reported_ids
                    .get(&framework_id)
                    .is_some_and(|ids| ids.contains(&task_id));
                if was_reported {
                    continue;
                }
                debug!(%agent_id, %framework_id, %task_id, "killing task unreported after re-registration");
                if let Some(agent) = self.agents.get(agent_id) {
                    agent.conn.send(AgentMessage::KillTask {
                        framework_id: framework_id.clone(),
                        task_id,
                    });
                }
            }
        }

        // Tasks currently in the live arena but not in the report: the
        // agent restarted without them. Kill on the agent, mark lost for
        // the framework.
        let live_unreported: Vec<_> = self
            .agents
            .get(agent_id)
            .map(|agent| {
                agent
                    .tasks
                    .iter()
                    .flat_map(|(framework_id, tasks)| {
                        tasks
                            .keys()
                            .filter(|task_id| {
                                !reported_ids
                                    .get(framework_id)
                                    .is_some_and(|ids| ids.contains(*task_id))
                            })
                            .map(|task_id| (framework_id.clone(), task_id.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (framework_id, task_id) in live_unreported {
            let in_kill_list = self
                .agents
                .get(agent_id)
                .and_then(|agent| agent.killed_tasks.get(&framework_id))
                .is_some_and(|killed| killed.contains(&task_id));
            if let Some(agent) = self.agents.get(agent_id) {
                agent.conn.send(AgentMessage::KillTask {
                    framework_id: framework_id.clone(),
                    task_id: task_id.clone(),
                });
            }
            let state = if in_kill_list {
                TaskState::Killed
            } else {
                TaskState::Lost
            };
            self.finish_task(agent_id, &framework_id, &task_id, state, "task unaccounted for after agent re-registration");
        }
    }

    /// Install one task reported by a re-registering agent.
    fn adopt_reported_task(&mut self, agent_id: &AgentId, agent_task: AgentTask) {
        let framework_id = agent_task.framework_id.clone();
        let task_id = agent_task.info.task_id.clone();

        if self.frameworks.is_completed(&framework_id) {
            // The framework was torn down while the agent was away; its
            // workload must go.
            if let Some(agent) = self.agents.get(agent_id) {
                agent.conn.send(AgentMessage::ShutdownFramework {
                    framework_id: framework_id.clone(),
                });
            }
            return;
        }

        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };

        match agent.task_mut(&framework_id, &task_id) {
            Some(task) => {
                // Agent is authoritative for terminal/non-terminal.
                if agent_task.state.is_terminal() && !task.state.is_terminal() {
                    task.state = agent_task.state;
                    agent.discharge_task(&framework_id, &task_id);
                } else if !agent_task.state.is_terminal() {
                    task.state = agent_task.state;
                }
            }
            None => {
                let charged = !agent_task.state.is_terminal();
                agent.add_task(Task {
                    info: agent_task.info.clone(),
                    framework_id: framework_id.clone(),
                    state: agent_task.state,
                    latest_status: None,
                    resources_charged: charged,
                });
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework
                        .tasks
                        .insert(task_id.clone(), agent_id.clone());
                }
            }
        }
    }

    // -- registry commit continuations -----------------------------------

    pub(crate) fn handle_registry_committed(
        &mut self,
        intent: RegistryIntent,
        result: Result<bool, RegistrarError>,
    ) {
        if let Err(error) = &result {
            if error.is_fatal() {
                self.abdicate("registry unavailable");
                return;
            }
        }
        match intent {
            RegistryIntent::Admit {
                info,
                conn,
                checkpointed,
                version,
            } => self.finish_admit(info, conn, checkpointed, version, result),
            RegistryIntent::Readmit {
                info,
                conn,
                reregistration,
            } => self.finish_readmit(info, conn, *reregistration, result),
            RegistryIntent::MarkUnreachable { info, since } => {
                self.finish_mark_unreachable(info, since, result)
            }
            RegistryIntent::Prune { ids, reply } => self.finish_prune(ids, reply, result),
            RegistryIntent::Remove { info, reply } => self.finish_remove(info, reply, result),
        }
    }

    fn finish_admit(
        &mut self,
        info: AgentInfo,
        conn: AgentConn,
        checkpointed: Resources,
        version: String,
        result: Result<bool, RegistrarError>,
    ) {
        self.agents.registering.remove(&conn.peer);
        let Some(agent_id) = info.id.clone() else {
            return;
        };
        match result {
            Ok(_) => {
                let epoch = self.bump_epoch();
                let agent = Agent::new(
                    agent_id.clone(),
                    info.clone(),
                    conn,
                    checkpointed,
                    version,
                    epoch,
                );
                self.machines
                    .track_agent(&info.machine_id(), agent_id.clone());
                let unavailability = self
                    .machines
                    .get(&info.machine_id())
                    .and_then(|m| m.unavailability);
                self.allocator.add_agent(
                    &agent_id,
                    &info,
                    &info.capabilities,
                    unavailability,
                    &agent.total,
                    agent.used(),
                );
                agent.conn.send(AgentMessage::Registered {
                    agent_id: agent_id.clone(),
                });
                self.agents.insert(agent);
                self.subscribers
                    .broadcast(MasterEvent::AgentAdded { agent: info });
                info!(%agent_id, "agent registered");
            }
            Err(error) if error.is_conflict() => {
                // A generated id collided with an admitted one. The odds
                // are negligible; the loser is rejected deterministically.
                warn!(%agent_id, %error, "admission conflict, rejecting registration");
                conn.send(AgentMessage::RegistrationRefused {
                    message: "agent id collision".to_owned(),
                });
            }
            Err(error) => {
                warn!(%agent_id, %error, "admission failed");
                conn.send(AgentMessage::RegistrationRefused {
                    message: error.to_string(),
                });
            }
        }
    }

    fn finish_readmit(
        &mut self,
        info: AgentInfo,
        conn: AgentConn,
        rereg: Reregistration,
        result: Result<bool, RegistrarError>,
    ) {
        if let Some(agent_id) = &info.id {
            self.agents.reregistering.remove(agent_id);
        }
        match result {
            // Ok(false) means the agent was already admitted: an earlier
            // retry committed. Either way the agent is admitted now.
            Ok(_) => self.install_reregistered_agent(info, conn, rereg),
            Err(error) if error.is_conflict() => {
                // A concurrent commit changed the picture; the registry
                // still holds the agent admitted, so proceed.
                warn!(agent_id = ?info.id, %error, "re-admission conflict, proceeding");
                self.install_reregistered_agent(info, conn, rereg);
            }
            Err(error) => {
                warn!(agent_id = ?info.id, %error, "re-admission failed");
                conn.send(AgentMessage::RegistrationRefused {
                    message: error.to_string(),
                });
            }
        }
    }

    fn finish_mark_unreachable(
        &mut self,
        info: AgentInfo,
        since: chrono::DateTime<Utc>,
        result: Result<bool, RegistrarError>,
    ) {
        let Some(agent_id) = info.id.clone() else {
            return;
        };
        self.agents.removing.remove(&agent_id);
        match result {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                // Concurrently removed; the agent is gone either way.
                warn!(%agent_id, %error, "mark-unreachable conflict, proceeding");
            }
            Err(error) => {
                warn!(%agent_id, %error, "mark-unreachable failed");
                return;
            }
        }
        info!(%agent_id, "agent marked unreachable");
        self.agents.unreachable.insert(agent_id.clone(), since);
        self.agents.recovered.remove(&agent_id);
        self.remove_agent_from_cluster(&agent_id, "agent unreachable", true);
    }

    fn finish_prune(
        &mut self,
        ids: HashSet<AgentId>,
        reply: Option<tokio::sync::oneshot::Sender<OperatorReply>>,
        result: Result<bool, RegistrarError>,
    ) {
        match result {
            Ok(_) => {
                for id in &ids {
                    self.agents.unreachable.remove(id);
                    self.unreachable_tasks.remove(id);
                }
                debug!(count = ids.len(), "pruned unreachable agents");
                if let Some(reply) = reply {
                    let _ = reply.send(OperatorReply::of(Ok(OperatorResponse::Ack)));
                }
            }
            Err(error) => {
                warn!(%error, "prune failed");
                if let Some(reply) = reply {
                    let _ = reply.send(OperatorReply::of(Err(error.into())));
                }
            }
        }
    }

    fn finish_remove(
        &mut self,
        info: AgentInfo,
        reply: Option<tokio::sync::oneshot::Sender<OperatorReply>>,
        result: Result<bool, RegistrarError>,
    ) {
        let Some(agent_id) = info.id.clone() else {
            return;
        };
        self.agents.removing.remove(&agent_id);
        match result {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                warn!(%agent_id, %error, "removal conflict, proceeding");
            }
            Err(error) => {
                warn!(%agent_id, %error, "removal failed");
                if let Some(reply) = reply {
                    let _ = reply.send(OperatorReply::of(Err(error.into())));
                }
                return;
            }
        }
        self.agents.removed.insert(agent_id.clone());
        self.agents.unreachable.remove(&agent_id);
        self.agents.recovered.remove(&agent_id);
        if let Some(agent) = self.agents.get(&agent_id) {
            agent.conn.send(AgentMessage::Shutdown {
                message: "agent removed by operator".to_owned(),
            });
        }
        self.remove_agent_from_cluster(&agent_id, "agent removed", false);
        info!(%agent_id, "agent removed");
        if let Some(reply) = reply {
            let _ = reply.send(OperatorReply::of(Ok(OperatorResponse::Ack)));
        }
    }

    // -- disconnection and unreachability --------------------------------

    pub(crate) fn handle_agent_disconnected(&mut self, peer: flotilla_model::PeerAddr) {
        let Some(agent_id) = self.agents.id_by_address(&peer).cloned() else {
            return;
        };
        let epoch = self.bump_epoch();
        let Some(agent) = self.agents.get_mut(&agent_id) else {
            return;
        };
        if !agent.connected {
            return;
        }
        agent.connected = false;
        agent.active = false;
        agent.epoch = epoch;
        info!(%agent_id, "agent disconnected");

        // No new offers while disconnected, and existing ones are pulled
        // back immediately.
        let offer_ids: Vec<_> = agent.offers.iter().cloned().collect();
        let inverse_ids: Vec<_> = agent.inverse_offers.iter().cloned().collect();
        for offer_id in offer_ids {
            self.rescind_offer(&offer_id);
        }
        for inverse_offer_id in inverse_ids {
            self.rescind_inverse_offer(&inverse_offer_id);
        }

        self.allocator.deactivate_agent(&agent_id);
        self.post_after(
            self.config.agent_reregister_timeout,
            Event::AgentReregisterDeadline { agent_id, epoch },
        );
    }

    pub(crate) fn handle_agent_health_check_failed(&mut self, agent_id: AgentId) {
        let Some(agent) = self.agents.get(&agent_id) else {
            return;
        };
        let info = agent.info.clone();
        self.try_mark_unreachable(info, Event::AgentHealthCheckFailed { agent_id });
    }

    pub(crate) fn handle_agent_reregister_deadline(&mut self, agent_id: AgentId, epoch: u64) {
        // Recovered agents that never re-registered.
        if let Some(info) = self.agents.recovered.get(&agent_id).cloned() {
            self.try_mark_unreachable(info, Event::AgentReregisterDeadline { agent_id, epoch });
            return;
        }
        // Disconnected live agents: only if this deadline still matches
        // the disconnect it was armed for.
        let Some(agent) = self.agents.get(&agent_id) else {
            return;
        };
        if agent.connected || agent.epoch != epoch {
            return;
        }
        let info = agent.info.clone();
        self.try_mark_unreachable(info, Event::AgentReregisterDeadline { agent_id, epoch });
    }

    /// Submit a MarkUnreachable, throttled so a network blip cannot stampede
    /// the registry. A deferred submission retries via `retry`.
    fn try_mark_unreachable(&mut self, info: AgentInfo, retry: Event) {
        let Some(agent_id) = info.id.clone() else {
            return;
        };
        if self.agents.removing.contains(&agent_id) {
            return;
        }
        if let Some(limiter) = &mut self.removal_limiter {
            match limiter.acquire(tokio::time::Instant::now()) {
                LimitDecision::Admit => limiter.release(),
                LimitDecision::Defer(wait) => {
                    limiter.release();
                    debug!(%agent_id, ?wait, "unreachability submission throttled");
                    self.post_after(wait, retry);
                    return;
                }
                LimitDecision::Drop => {
                    // Removal submissions are never dropped outright.
                    self.post_after(std::time::Duration::from_secs(1), retry);
                    return;
                }
            }
        }
        let since = Utc::now();
        self.agents.removing.insert(agent_id);
        self.submit_registry(
            RegistryIntent::MarkUnreachable {
                info: info.clone(),
                since,
            },
            RegistryOperation::MarkUnreachable(info, since),
        );
    }

    // -- registry garbage collection -------------------------------------

    pub(crate) fn handle_registry_gc_tick(&mut self) {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.registry_max_agent_age)
            .unwrap_or(chrono::Duration::MAX);

        // Oldest first, so both caps evict the longest-unreachable agents.
        let mut entries: Vec<(AgentId, chrono::DateTime<Utc>)> = self
            .agents
            .unreachable
            .iter()
            .map(|(id, when)| (id.clone(), *when))
            .collect();
        entries.sort_by_key(|(_, when)| *when);

        let mut prune: HashSet<AgentId> = entries
            .iter()
            .filter(|(_, when)| now.signed_duration_since(*when) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let surviving = entries.len() - prune.len();
        if surviving > self.config.registry_max_agent_count {
            let mut excess = surviving - self.config.registry_max_agent_count;
            for (id, _) in &entries {
                if excess == 0 {
                    break;
                }
                if prune.insert(id.clone()) {
                    excess -= 1;
                }
            }
        }

        if prune.is_empty() {
            return;
        }
        debug!(count = prune.len(), "submitting unreachable prune");
        self.submit_registry(
            RegistryIntent::Prune {
                ids: prune.clone(),
                reply: None,
            },
            RegistryOperation::PruneUnreachable(prune),
        );
    }

    // -- removal mechanics ------------------------------------------------

    /// Drop a live agent from every in-memory structure, notifying
    /// frameworks and the allocator. Tasks transition to LOST; when the
    /// agent is crossing into unreachable they are additionally remembered
    /// for re-registration reconciliation.
    pub(crate) fn remove_agent_from_cluster(
        &mut self,
        agent_id: &AgentId,
        reason: &str,
        remember_tasks: bool,
    ) {
        // Pull back outstanding offers first, while the rosters still
        // know the agent.
        let offer_ids: Vec<_> = self
            .agents
            .get(agent_id)
            .map(|agent| agent.offers.iter().cloned().collect())
            .unwrap_or_default();
        for offer_id in offer_ids {
            if let Some(offer) = self.discard_offer(&offer_id, true) {
                self.allocator.recover_resources(
                    &offer.framework_id,
                    &offer.agent_id,
                    &offer.resources,
                    None,
                );
            }
        }
        let inverse_ids: Vec<_> = self
            .agents
            .get(agent_id)
            .map(|agent| agent.inverse_offers.iter().cloned().collect())
            .unwrap_or_default();
        for inverse_offer_id in inverse_ids {
            self.rescind_inverse_offer(&inverse_offer_id);
        }

        let Some(mut agent) = self.agents.remove(agent_id) else {
            return;
        };
        self.machines
            .untrack_agent(&agent.info.machine_id(), agent_id);

        let mut remembered: HashMap<_, Vec<_>> = HashMap::new();
        for (framework_id, tasks) in agent.tasks.drain() {
            for (task_id, task) in tasks {
                if task.resources_charged {
                    self.allocator.recover_resources(
                        &framework_id,
                        agent_id,
                        &task.info.resources,
                        None,
                    );
                }
                remembered
                    .entry(framework_id.clone())
                    .or_default()
                    .push(task_id.clone());
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.tasks.remove(&task_id);
                    framework.push_completed_task(
                        CompletedTask {
                            info: task.info.clone(),
                            agent_id: agent_id.clone(),
                            state: TaskState::Lost,
                            finished_at: Utc::now(),
                        },
                        self.config.max_completed_tasks_per_framework,
                    );
                    let status = TaskStatus::from_master(
                        task_id.clone(),
                        Some(agent_id.clone()),
                        TaskState::Lost,
                    )
                    .with_message(reason);
                    framework.send(SchedulerEvent::Update { status });
                    self.subscribers.broadcast(MasterEvent::TaskUpdated {
                        framework_id: framework_id.clone(),
                        task_id,
                        state: TaskState::Lost,
                    });
                }
            }
        }

        for (framework_id, executors) in agent.executors.drain() {
            for (executor_id, executor) in executors {
                self.allocator.recover_resources(
                    &framework_id,
                    agent_id,
                    &executor.resources,
                    None,
                );
                if let Some(framework) = self.frameworks.get(&framework_id) {
                    framework.send(SchedulerEvent::Failure {
                        agent_id: Some(agent_id.clone()),
                        executor_id: Some(executor_id),
                    });
                }
            }
        }

        for (framework_id, pending) in agent.pending_tasks.drain() {
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                for task_id in pending {
                    framework.pending_tasks.remove(&task_id);
                }
            }
        }

        self.pending_acks.retain(|(id, _, _), _| id != agent_id);
        if remember_tasks {
            self.unreachable_tasks
                .insert(agent_id.clone(), remembered);
        }

        self.allocator.remove_agent(agent_id);
        self.subscribers.broadcast(MasterEvent::AgentRemoved {
            agent_id: agent_id.clone(),
        });
    }
}
