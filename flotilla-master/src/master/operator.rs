//! Operator API dispatch.
//!
//! Every endpoint except health and version is authorization-gated; the
//! handler suspends on the authorizer and executes on the continuation.
//! Read endpoints serve plain snapshots; mutations reuse the same helpers
//! the scheduler paths use, so an operator reserve and a framework
//! reserve take the same code path through agent bookkeeping.

// Layer 1: Standard library imports
use std::collections::HashSet;

// Layer 2: Third-party crate imports
use tokio::sync::oneshot;

// Layer 3: Internal module imports
use crate::allocator::Allocator;
use crate::auth::{Action, Authenticator, AuthorizationError, Authorizer};
use crate::error::MasterError;
use crate::event::{Event, OperatorReply, RegistryIntent};
use crate::master::Master;
use crate::roster::frameworks::CompletedFramework;
use crate::roster::{Agent, Framework};
use flotilla_model::{
    AgentId, AgentMessage, AgentSnapshot, FrameworkSnapshot, MachineId, MachineMode,
    MaintenanceSchedule, MaintenanceWindow, Operation, OperatorCall, OperatorResponse, Resources,
    StateSnapshot, TaskSnapshot,
};
use flotilla_registrar::RegistryOperation;

/// The authorization action guarding an operator call; `None` for the
/// ungated health and version probes.
fn action_for(call: &OperatorCall) -> Option<Action> {
    let action = match call {
        OperatorCall::GetHealth | OperatorCall::GetVersion => return None,
        OperatorCall::GetQuota => Action::GetQuota,
        OperatorCall::SetQuota { role, .. } => Action::SetQuota { role: role.clone() },
        OperatorCall::RemoveQuota { role } => Action::RemoveQuota { role: role.clone() },
        OperatorCall::GetWeights | OperatorCall::UpdateWeights { .. } => Action::UpdateWeights,
        OperatorCall::UpdateMaintenanceSchedule { .. }
        | OperatorCall::StartMaintenance { .. }
        | OperatorCall::StopMaintenance { .. } => Action::UpdateMaintenance,
        OperatorCall::MarkAgentGone { .. } => Action::MarkAgentGone,
        OperatorCall::ReserveResources { resources, .. } => Action::Reserve {
            role: resources.iter().find_map(|r| r.role.clone()),
        },
        OperatorCall::UnreserveResources { resources, .. } => Action::Unreserve {
            role: resources.iter().find_map(|r| r.role.clone()),
        },
        OperatorCall::CreateVolumes { volumes, .. } => Action::CreateVolume {
            role: volumes.iter().find_map(|r| r.role.clone()),
        },
        OperatorCall::DestroyVolumes { volumes, .. } => Action::DestroyVolume {
            role: volumes.iter().find_map(|r| r.role.clone()),
        },
        _ => Action::ViewState,
    };
    Some(action)
}

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: flotilla_registrar::Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    pub(crate) fn handle_operator_call(
        &mut self,
        principal: Option<String>,
        call: OperatorCall,
        reply: oneshot::Sender<OperatorReply>,
    ) {
        match action_for(&call) {
            None => self.execute_operator_call(call, reply),
            Some(action) => {
                let request = Self::authorization(principal.clone(), action);
                self.submit_authorization(request, move |result| Event::OperatorAuthorized {
                    principal,
                    call,
                    reply,
                    result,
                });
            }
        }
    }

    pub(crate) fn handle_operator_authorized(
        &mut self,
        _principal: Option<String>,
        call: OperatorCall,
        reply: oneshot::Sender<OperatorReply>,
        result: Result<bool, AuthorizationError>,
    ) {
        match result {
            Ok(true) => self.execute_operator_call(call, reply),
            Ok(false) => {
                let _ = reply.send(OperatorReply::of(Err(MasterError::AuthorizationDenied(
                    call.name().to_owned(),
                ))));
            }
            Err(failure) => {
                let _ = reply.send(OperatorReply::of(Err(MasterError::AuthorizationFailure(
                    failure.to_string(),
                ))));
            }
        }
    }

    fn execute_operator_call(&mut self, call: OperatorCall, reply: oneshot::Sender<OperatorReply>) {
        let response = match call {
            OperatorCall::GetHealth => Ok(OperatorResponse::Health { healthy: true }),
            OperatorCall::GetVersion => Ok(OperatorResponse::Version {
                version: env!("CARGO_PKG_VERSION").to_owned(),
            }),
            OperatorCall::GetFlags => match serde_json::to_value(&self.config) {
                Ok(flags) => Ok(OperatorResponse::Flags { flags }),
                Err(error) => Err(MasterError::InvalidCall(error.to_string())),
            },
            OperatorCall::GetState => Ok(OperatorResponse::State {
                state: self.state_snapshot(),
            }),
            OperatorCall::GetAgents => Ok(OperatorResponse::Agents {
                agents: self.agent_snapshots(),
            }),
            OperatorCall::GetFrameworks => Ok(OperatorResponse::Frameworks {
                frameworks: self.framework_snapshots(),
                completed_frameworks: self.completed_framework_snapshots(),
            }),
            OperatorCall::GetTasks => Ok(OperatorResponse::Tasks {
                tasks: self.task_snapshots(),
            }),
            OperatorCall::GetRoles => Ok(OperatorResponse::Roles {
                roles: self.roles.snapshot(),
            }),
            OperatorCall::GetMaintenanceSchedule => Ok(OperatorResponse::MaintenanceSchedule {
                schedule: self.maintenance_schedule(),
            }),
            OperatorCall::GetMaintenanceStatus => Ok(OperatorResponse::MaintenanceStatus {
                statuses: self.machines.statuses(),
            }),
            OperatorCall::UpdateMaintenanceSchedule { schedule } => {
                self.update_maintenance_schedule(schedule)
            }
            OperatorCall::StartMaintenance { machines } => self.start_maintenance(machines),
            OperatorCall::StopMaintenance { machines } => self.stop_maintenance(machines),
            OperatorCall::GetQuota => Ok(OperatorResponse::Quota {
                quotas: self.roles.quotas(),
            }),
            OperatorCall::SetQuota { role, guarantee } => self.set_quota(role, guarantee),
            OperatorCall::RemoveQuota { role } => self.remove_quota(role),
            OperatorCall::GetWeights => Ok(OperatorResponse::Weights {
                weights: self.roles.weights(),
            }),
            OperatorCall::UpdateWeights { weights } => self.update_weights(weights),
            OperatorCall::ReserveResources {
                agent_id,
                resources,
            } => self.operator_transform(agent_id, Operation::Reserve { resources }),
            OperatorCall::UnreserveResources {
                agent_id,
                resources,
            } => self.operator_transform(agent_id, Operation::Unreserve { resources }),
            OperatorCall::CreateVolumes { agent_id, volumes } => {
                self.operator_transform(agent_id, Operation::Create { volumes })
            }
            OperatorCall::DestroyVolumes { agent_id, volumes } => {
                self.operator_transform(agent_id, Operation::Destroy { volumes })
            }
            OperatorCall::MarkAgentGone { agent_id } => {
                // Replies once the registry commit lands.
                self.mark_agent_gone(agent_id, reply);
                return;
            }
            OperatorCall::Subscribe => {
                let (stream_id, events) =
                    self.subscribers.subscribe(self.config.heartbeat_interval);
                let _ = reply.send(OperatorReply {
                    response: Ok(OperatorResponse::Subscribed { stream_id }),
                    events: Some(events),
                });
                return;
            }
        };
        let _ = reply.send(OperatorReply::of(response));
    }

    // -- quota and weights -------------------------------------------------

    fn set_quota(
        &mut self,
        role: String,
        guarantee: Resources,
    ) -> Result<OperatorResponse, MasterError> {
        if guarantee.is_empty() {
            return Err(MasterError::InvalidCall(
                "quota guarantee must not be empty".to_owned(),
            ));
        }
        if !self.roles.permitted(&role) {
            return Err(MasterError::InvalidCall(format!(
                "role {role} is not whitelisted"
            )));
        }
        self.roles.set_quota(role.clone(), guarantee.clone());
        self.allocator.set_quota(&role, &guarantee);
        Ok(OperatorResponse::Ack)
    }

    fn remove_quota(&mut self, role: String) -> Result<OperatorResponse, MasterError> {
        if self.roles.remove_quota(&role).is_none() {
            return Err(MasterError::InvalidCall(format!(
                "role {role} has no quota"
            )));
        }
        self.allocator.remove_quota(&role);
        Ok(OperatorResponse::Ack)
    }

    fn update_weights(
        &mut self,
        weights: Vec<(String, f64)>,
    ) -> Result<OperatorResponse, MasterError> {
        if let Some((role, weight)) = weights.iter().find(|(_, w)| *w <= 0.0) {
            return Err(MasterError::InvalidCall(format!(
                "weight {weight} for role {role} must be > 0"
            )));
        }
        for (role, weight) in &weights {
            self.roles.set_weight(role.clone(), *weight);
        }
        self.allocator.update_weights(&weights);
        Ok(OperatorResponse::Ack)
    }

    // -- operator-driven reservations and volumes --------------------------

    /// Apply a reservation or volume operation on behalf of an operator.
    ///
    /// Resources tied up in outstanding offers are freed by rescinding
    /// offers on the agent until the operation fits.
    fn operator_transform(
        &mut self,
        agent_id: AgentId,
        operation: Operation,
    ) -> Result<OperatorResponse, MasterError> {
        let Some(agent) = self.agents.get(&agent_id) else {
            return Err(MasterError::UnknownAgent(agent_id));
        };
        operation.validate()?;
        let needed = match &operation {
            Operation::Reserve { resources } => resources.as_unreserved(),
            Operation::Unreserve { resources } => resources.clone(),
            Operation::Create { volumes } => volumes.without_volumes(),
            Operation::Destroy { volumes } => volumes.clone(),
            _ => {
                return Err(MasterError::InvalidCall(
                    "operator calls cannot launch tasks".to_owned(),
                ))
            }
        };

        // The unused portion of the agent must cover the source flavor.
        let unused = agent
            .total
            .checked_sub(&agent.used_total())
            .unwrap_or_default();
        if !unused.contains(&needed) {
            return Err(MasterError::Resource(
                flotilla_model::ResourceError::Insufficient {
                    name: needed
                        .iter()
                        .next()
                        .map(|r| r.name.clone())
                        .unwrap_or_default(),
                },
            ));
        }

        // Free what outstanding offers are holding, offer by offer.
        while !self
            .agents
            .get(&agent_id)
            .is_some_and(|a| a.available().contains(&needed))
        {
            let next_offer = self
                .agents
                .get(&agent_id)
                .and_then(|a| a.offers.iter().next().cloned());
            let Some(offer_id) = next_offer else {
                break;
            };
            self.rescind_offer(&offer_id);
        }

        self.apply_transformation_to_agent(&agent_id, &operation);
        Ok(OperatorResponse::Ack)
    }

    // -- agent removal -----------------------------------------------------

    /// Declare an agent permanently gone: removal for live agents, prune
    /// plus tombstone for unreachable ones.
    fn mark_agent_gone(&mut self, agent_id: AgentId, reply: oneshot::Sender<OperatorReply>) {
        if self.agents.removing.contains(&agent_id) {
            let _ = reply.send(OperatorReply::of(Err(MasterError::InvalidCall(format!(
                "removal of {agent_id} is already in progress"
            )))));
            return;
        }
        if let Some(agent) = self.agents.get(&agent_id) {
            let info = agent.info.clone();
            self.agents.removing.insert(agent_id);
            self.submit_registry(
                RegistryIntent::Remove {
                    info: info.clone(),
                    reply: Some(reply),
                },
                RegistryOperation::Remove(info),
            );
        } else if let Some(info) = self.agents.recovered.get(&agent_id).cloned() {
            self.agents.removing.insert(agent_id);
            self.submit_registry(
                RegistryIntent::Remove {
                    info: info.clone(),
                    reply: Some(reply),
                },
                RegistryOperation::Remove(info),
            );
        } else if self.agents.unreachable.contains_key(&agent_id) {
            self.agents.removed.insert(agent_id.clone());
            let ids: HashSet<AgentId> = [agent_id].into_iter().collect();
            self.submit_registry(
                RegistryIntent::Prune {
                    ids: ids.clone(),
                    reply: Some(reply),
                },
                RegistryOperation::PruneUnreachable(ids),
            );
        } else {
            let _ = reply.send(OperatorReply::of(Err(MasterError::UnknownAgent(agent_id))));
        }
    }

    // -- maintenance -------------------------------------------------------

    fn update_maintenance_schedule(
        &mut self,
        schedule: MaintenanceSchedule,
    ) -> Result<OperatorResponse, MasterError> {
        // A machine may appear in at most one window.
        let mut seen: HashSet<&MachineId> = HashSet::new();
        for machine in schedule.machines() {
            if machine.hostname.is_empty() {
                return Err(MasterError::InvalidCall(
                    "maintenance window names a machine without a hostname".to_owned(),
                ));
            }
            if !seen.insert(machine) {
                return Err(MasterError::InvalidCall(format!(
                    "machine {machine} appears in more than one maintenance window"
                )));
            }
        }

        // Machines dropped from the schedule go back up.
        let scheduled: HashSet<MachineId> = schedule.machines().cloned().collect();
        let previously_draining: Vec<MachineId> = self
            .machines
            .statuses()
            .into_iter()
            .filter(|status| status.mode == MachineMode::Draining)
            .map(|status| status.machine)
            .collect();
        for machine in previously_draining {
            if scheduled.contains(&machine) {
                continue;
            }
            let entry = self.machines.entry(&machine);
            entry.mode = MachineMode::Up;
            entry.unavailability = None;
            entry.inverse_offer_statuses.clear();
            for agent_id in self.machines.agents_on(&machine) {
                self.allocator.update_unavailability(&agent_id, None);
            }
        }

        for window in &schedule.windows {
            for machine in &window.machine_ids {
                let entry = self.machines.entry(machine);
                if entry.mode != MachineMode::Down {
                    entry.mode = MachineMode::Draining;
                }
                entry.unavailability = Some(window.unavailability);
                for agent_id in self.machines.agents_on(machine) {
                    self.allocator
                        .update_unavailability(&agent_id, Some(window.unavailability));
                }
            }
        }
        Ok(OperatorResponse::Ack)
    }

    fn start_maintenance(
        &mut self,
        machines: Vec<MachineId>,
    ) -> Result<OperatorResponse, MasterError> {
        for machine in &machines {
            if self.machines.mode(machine) != MachineMode::Draining {
                return Err(MasterError::InvalidCall(format!(
                    "machine {machine} is not scheduled for maintenance"
                )));
            }
        }
        for machine in &machines {
            self.machines.entry(machine).mode = MachineMode::Down;
            for agent_id in self.machines.agents_on(machine) {
                if self.agents.removing.contains(&agent_id) {
                    continue;
                }
                let Some(agent) = self.agents.get(&agent_id) else {
                    continue;
                };
                if agent.connected {
                    agent.conn.send(AgentMessage::Shutdown {
                        message: "machine is down for maintenance".to_owned(),
                    });
                }
                let info = agent.info.clone();
                self.agents.removing.insert(agent_id);
                self.submit_registry(
                    RegistryIntent::Remove {
                        info: info.clone(),
                        reply: None,
                    },
                    RegistryOperation::Remove(info),
                );
            }
        }
        Ok(OperatorResponse::Ack)
    }

    fn stop_maintenance(
        &mut self,
        machines: Vec<MachineId>,
    ) -> Result<OperatorResponse, MasterError> {
        for machine in &machines {
            if self.machines.mode(machine) != MachineMode::Down {
                return Err(MasterError::InvalidCall(format!(
                    "machine {machine} is not down"
                )));
            }
        }
        for machine in &machines {
            let entry = self.machines.entry(machine);
            entry.mode = MachineMode::Up;
            entry.unavailability = None;
            entry.inverse_offer_statuses.clear();
        }
        Ok(OperatorResponse::Ack)
    }

    /// Reconstruct the schedule view from per-machine state.
    fn maintenance_schedule(&self) -> MaintenanceSchedule {
        let windows = self
            .machines
            .statuses()
            .into_iter()
            .filter_map(|status| {
                status.unavailability.map(|unavailability| MaintenanceWindow {
                    machine_ids: vec![status.machine],
                    unavailability,
                })
            })
            .collect();
        MaintenanceSchedule { windows }
    }

    // -- snapshots ---------------------------------------------------------

    fn agent_snapshot(agent: &Agent) -> AgentSnapshot {
        let mut used: Vec<_> = agent
            .used()
            .iter()
            .map(|(framework_id, resources)| (framework_id.clone(), resources.clone()))
            .collect();
        used.sort_by(|a, b| a.0.cmp(&b.0));
        AgentSnapshot {
            agent: agent.info.clone(),
            version: agent.version.clone(),
            connected: agent.connected,
            active: agent.active,
            registered_at: agent.registered_at,
            reregistered_at: agent.reregistered_at,
            total: agent.total.clone(),
            checkpointed: agent.checkpointed.clone(),
            used,
            offered: agent.offered.clone(),
        }
    }

    fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<_> = self.agents.iter().map(Self::agent_snapshot).collect();
        agents.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
        agents
    }

    fn framework_snapshot(&self, framework: &Framework) -> FrameworkSnapshot {
        let mut used: Vec<(AgentId, Resources)> = self
            .agents
            .iter()
            .filter_map(|agent| {
                let on_agent = agent.used_by(&framework.id);
                (!on_agent.is_empty()).then(|| (agent.id.clone(), on_agent))
            })
            .collect();
        used.sort_by(|a, b| a.0.cmp(&b.0));
        let mut offers: Vec<_> = framework.offers.iter().cloned().collect();
        offers.sort();
        FrameworkSnapshot {
            id: framework.id.clone(),
            info: framework.info.clone(),
            connected: framework.connected,
            active: framework.active,
            registered_at: framework.registered_at,
            reregistered_at: framework.reregistered_at,
            used,
            offers,
            completed_tasks: framework
                .completed_tasks
                .iter()
                .map(|task| Self::completed_task_snapshot(&framework.id, task))
                .collect(),
        }
    }

    fn completed_task_snapshot(
        framework_id: &flotilla_model::FrameworkId,
        task: &crate::roster::CompletedTask,
    ) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task.info.task_id.clone(),
            name: task.info.name.clone(),
            framework_id: framework_id.clone(),
            agent_id: task.agent_id.clone(),
            state: task.state,
            resources: task.info.resources.clone(),
        }
    }

    fn framework_snapshots(&self) -> Vec<FrameworkSnapshot> {
        let mut frameworks: Vec<_> = self
            .frameworks
            .iter()
            .map(|framework| self.framework_snapshot(framework))
            .collect();
        frameworks.sort_by(|a, b| a.id.cmp(&b.id));
        frameworks
    }

    fn completed_framework_snapshot(completed: &CompletedFramework) -> FrameworkSnapshot {
        FrameworkSnapshot {
            id: completed.id.clone(),
            info: completed.info.clone(),
            connected: false,
            active: false,
            registered_at: completed.registered_at,
            reregistered_at: None,
            used: Vec::new(),
            offers: Vec::new(),
            completed_tasks: completed
                .completed_tasks
                .iter()
                .map(|task| Self::completed_task_snapshot(&completed.id, task))
                .collect(),
        }
    }

    fn completed_framework_snapshots(&self) -> Vec<FrameworkSnapshot> {
        self.frameworks
            .completed()
            .map(Self::completed_framework_snapshot)
            .collect()
    }

    fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = Vec::new();
        for agent in self.agents.iter() {
            for (framework_id, per_framework) in &agent.tasks {
                for task in per_framework.values() {
                    tasks.push(TaskSnapshot {
                        task_id: task.info.task_id.clone(),
                        name: task.info.name.clone(),
                        framework_id: framework_id.clone(),
                        agent_id: agent.id.clone(),
                        state: task.state,
                        resources: task.info.resources.clone(),
                    });
                }
            }
        }
        for framework in self.frameworks.iter() {
            for (task_id, agent_id) in &framework.pending_tasks {
                tasks.push(TaskSnapshot {
                    task_id: task_id.clone(),
                    name: String::new(),
                    framework_id: framework.id.clone(),
                    agent_id: agent_id.clone(),
                    state: flotilla_model::TaskState::Staging,
                    resources: Resources::empty(),
                });
            }
        }
        tasks.sort_by(|a, b| (&a.framework_id, &a.task_id).cmp(&(&b.framework_id, &b.task_id)));
        tasks
    }

    /// The full operator state snapshot.
    pub(crate) fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            master_id: self.id,
            elected_at: self.elected_at,
            agents: self.agent_snapshots(),
            unreachable_agents: self
                .agents
                .unreachable
                .iter()
                .map(|(id, when)| (id.clone(), *when))
                .collect(),
            frameworks: self.framework_snapshots(),
            completed_frameworks: self.completed_framework_snapshots(),
            tasks: self.task_snapshots(),
        }
    }
}
