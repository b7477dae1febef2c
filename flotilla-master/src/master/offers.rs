//! The offer/accept pipeline.
//!
//! Offers are created on allocator decisions, handed to frameworks, and
//! leave the ledger through exactly one helper ([`Master::discard_offer`])
//! no matter which path removes them: accept, decline, rescind, expiry,
//! agent removal or framework removal.
//!
//! An accept is validated atomically (any bad offer refuses the whole
//! call, leaving state untouched), its offers are consumed up front, the
//! per-operation authorizations are gathered in parallel, and the
//! operations are then applied strictly in the framework's order, each
//! observing its predecessors' effects on the offered bundle.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use futures::future::join_all;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use crate::allocator::Allocator;
use crate::auth::{Action, Authenticator, AuthorizationError, AuthorizationRequest, Authorizer};
use crate::error::MasterError;
use crate::event::{Event, SchedulerConn};
use crate::master::Master;
use crate::roster::Task;
use flotilla_model::{
    AgentId, AgentMessage, Filters, FrameworkId, InverseOffer, InverseOfferId, MasterEvent, Offer,
    OfferId, Operation, Resources, SchedulerEvent, TaskInfo, TaskState, TaskStatus, Unavailability,
};

/// Build the authorization request guarding one offer operation.
fn operation_request(principal: Option<String>, operation: &Operation) -> AuthorizationRequest {
    fn first_role(resources: &Resources) -> Option<String> {
        resources.iter().find_map(|r| r.role.clone())
    }
    fn first_task(tasks: &[TaskInfo]) -> flotilla_model::TaskId {
        tasks
            .first()
            .map(|t| t.task_id.clone())
            .unwrap_or_else(|| flotilla_model::TaskId::new("unknown"))
    }
    let action = match operation {
        Operation::Reserve { resources } => Action::Reserve {
            role: first_role(resources),
        },
        Operation::Unreserve { resources } => Action::Unreserve {
            role: first_role(resources),
        },
        Operation::Create { volumes } => Action::CreateVolume {
            role: first_role(volumes),
        },
        Operation::Destroy { volumes } => Action::DestroyVolume {
            role: first_role(volumes),
        },
        Operation::Launch { tasks } => Action::RunTask {
            task_id: first_task(tasks),
        },
        Operation::LaunchGroup { tasks, .. } => Action::RunTask {
            task_id: first_task(tasks),
        },
    };
    AuthorizationRequest::new(principal, action)
}

/// The launch tasks named by an operation, if any.
fn launch_tasks(operation: &Operation) -> &[TaskInfo] {
    match operation {
        Operation::Launch { tasks } | Operation::LaunchGroup { tasks, .. } => tasks,
        _ => &[],
    }
}

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: flotilla_registrar::Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    // -- offer creation ----------------------------------------------------

    pub(crate) fn handle_allocator_offers(
        &mut self,
        framework_id: FrameworkId,
        offers: HashMap<AgentId, Resources>,
    ) {
        let framework_active = self
            .frameworks
            .get(&framework_id)
            .is_some_and(|f| f.active);

        let mut entries: Vec<(AgentId, Resources)> = offers.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batch: Vec<Offer> = Vec::new();
        for (agent_id, resources) in entries {
            let agent_active = self.agents.get(&agent_id).is_some_and(|a| a.active);
            if !framework_active || !agent_active {
                // Either side became ineligible between the allocator's
                // decision and this turn; hand the resources straight back.
                self.allocator
                    .recover_resources(&framework_id, &agent_id, &resources, None);
                continue;
            }

            let offer_id = OfferId::generate(&self.id, self.next_offer_seq);
            self.next_offer_seq += 1;
            let (hostname, machine_id) = match self.agents.get(&agent_id) {
                Some(agent) => (agent.info.hostname.clone(), agent.info.machine_id()),
                None => continue,
            };
            let unavailability = self
                .machines
                .get(&machine_id)
                .and_then(|m| m.unavailability);
            let offer = Offer {
                id: offer_id.clone(),
                framework_id: framework_id.clone(),
                agent_id: agent_id.clone(),
                hostname,
                resources: resources.clone(),
                unavailability,
            };

            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.offers.insert(offer_id.clone());
                agent.offered += resources;
            }
            self.offers.insert(offer.clone());
            if let Some(timeout) = self.config.offer_timeout {
                self.post_after(timeout, Event::OfferExpired { offer_id });
            }
            batch.push(offer);
        }

        if batch.is_empty() {
            return;
        }
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        for offer in &batch {
            framework.offers.insert(offer.id.clone());
        }
        debug!(%framework_id, count = batch.len(), "offers sent");
        framework.send(SchedulerEvent::Offers { offers: batch });
    }

    pub(crate) fn handle_allocator_inverse_offers(
        &mut self,
        framework_id: FrameworkId,
        agents: HashMap<AgentId, Unavailability>,
    ) {
        if !self.frameworks.contains(&framework_id) {
            return;
        }
        let mut entries: Vec<(AgentId, Unavailability)> = agents.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batch: Vec<InverseOffer> = Vec::new();
        for (agent_id, unavailability) in entries {
            if !self.agents.contains(&agent_id) {
                continue;
            }
            let inverse_offer_id = InverseOfferId::generate(&self.id, self.next_inverse_offer_seq);
            self.next_inverse_offer_seq += 1;
            let inverse = InverseOffer {
                id: inverse_offer_id.clone(),
                framework_id: framework_id.clone(),
                agent_id: agent_id.clone(),
                unavailability,
                resources: Resources::empty(),
            };
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.inverse_offers.insert(inverse_offer_id.clone());
            }
            self.offers.insert_inverse(inverse.clone());
            batch.push(inverse);
        }

        if batch.is_empty() {
            return;
        }
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        for inverse in &batch {
            framework.inverse_offers.insert(inverse.id.clone());
        }
        framework.send(SchedulerEvent::InverseOffers {
            inverse_offers: batch,
        });
    }

    // -- offer removal -----------------------------------------------------

    /// The single path by which an offer leaves the ledger and both offer
    /// sets. Returns the offer for the caller to recover or account.
    pub(crate) fn discard_offer(&mut self, offer_id: &OfferId, rescind: bool) -> Option<Offer> {
        let offer = self.offers.remove(offer_id)?;
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.offers.remove(offer_id);
            if rescind {
                framework.send(SchedulerEvent::Rescind {
                    offer_id: offer_id.clone(),
                });
            }
        }
        if let Some(agent) = self.agents.get_mut(&offer.agent_id) {
            agent.offers.remove(offer_id);
            agent.offered = agent
                .offered
                .checked_sub(&offer.resources)
                .unwrap_or_else(|error| {
                    warn!(agent_id = %offer.agent_id, %error, "offered counter underflow");
                    Resources::empty()
                });
        }
        Some(offer)
    }

    /// Rescind an offer and hand its resources back to the allocator.
    pub(crate) fn rescind_offer(&mut self, offer_id: &OfferId) {
        if let Some(offer) = self.discard_offer(offer_id, true) {
            self.allocator.recover_resources(
                &offer.framework_id,
                &offer.agent_id,
                &offer.resources,
                None,
            );
        }
    }

    pub(crate) fn discard_inverse_offer(
        &mut self,
        inverse_offer_id: &InverseOfferId,
        rescind: bool,
    ) -> Option<InverseOffer> {
        let inverse = self.offers.remove_inverse(inverse_offer_id)?;
        if let Some(framework) = self.frameworks.get_mut(&inverse.framework_id) {
            framework.inverse_offers.remove(inverse_offer_id);
            if rescind {
                framework.send(SchedulerEvent::RescindInverseOffer {
                    inverse_offer_id: inverse_offer_id.clone(),
                });
            }
        }
        if let Some(agent) = self.agents.get_mut(&inverse.agent_id) {
            agent.inverse_offers.remove(inverse_offer_id);
        }
        Some(inverse)
    }

    pub(crate) fn rescind_inverse_offer(&mut self, inverse_offer_id: &InverseOfferId) {
        self.discard_inverse_offer(inverse_offer_id, true);
    }

    /// An offer's expiration timer fired. Whoever removed the offer first
    /// wins; a stale timer finds nothing.
    pub(crate) fn handle_offer_expired(&mut self, offer_id: OfferId) {
        if self.offers.get(&offer_id).is_some() {
            debug!(%offer_id, "offer expired");
            self.rescind_offer(&offer_id);
        }
    }

    // -- accept / decline --------------------------------------------------

    /// Accept and Decline share this entry: a decline is an accept with no
    /// operations, and they are observationally equivalent on allocator
    /// inputs.
    pub(crate) fn handle_accept(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        offer_ids: Vec<OfferId>,
        operations: Vec<Operation>,
        filters: Option<Filters>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        if let Err(error) = self.validate_accept(&framework_id, &offer_ids, &operations) {
            // Atomic refusal: nothing was consumed, nothing applied.
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        // validate_accept guarantees at least one offer, all on one agent.
        let Some(agent_id) = offer_ids
            .first()
            .and_then(|id| self.offers.get(id))
            .map(|offer| offer.agent_id.clone())
        else {
            return;
        };

        // Consume the offers up front; from here on the bundle is in
        // flight and every exit path must recover what remains.
        let mut offered = Resources::empty();
        for offer_id in &offer_ids {
            if let Some(offer) = self.discard_offer(offer_id, false) {
                offered += offer.resources;
            }
        }

        if operations.is_empty() {
            // Decline: everything goes straight back, with filters.
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, filters);
            return;
        }

        // Launches stay pending while authorization is in flight; a kill
        // arriving meanwhile removes them from the pending maps and the
        // continuation reports them killed instead of launching.
        for operation in &operations {
            for task in launch_tasks(operation) {
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework
                        .pending_tasks
                        .insert(task.task_id.clone(), agent_id.clone());
                }
                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent
                        .pending_tasks
                        .entry(framework_id.clone())
                        .or_default()
                        .insert(task.task_id.clone());
                }
            }
        }

        let principal = self
            .frameworks
            .get(&framework_id)
            .and_then(|f| f.principal().map(str::to_owned));
        let authorizer = Arc::clone(&self.authorizer);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let verdicts = join_all(
                operations
                    .iter()
                    .map(|operation| authorizer.authorize(operation_request(principal.clone(), operation))),
            )
            .await;
            let operations = operations.into_iter().zip(verdicts).collect();
            let _ = tx.send(Event::AcceptAuthorized {
                framework_id,
                agent_id,
                offered,
                operations,
                filters,
            });
        });
    }

    /// Everything that can refuse an accept without touching state.
    fn validate_accept(
        &self,
        framework_id: &FrameworkId,
        offer_ids: &[OfferId],
        operations: &[Operation],
    ) -> Result<(), MasterError> {
        if offer_ids.is_empty() {
            return Err(MasterError::InvalidCall(
                "accept requires at least one offer".to_owned(),
            ));
        }
        let mut agent_id: Option<&AgentId> = None;
        for offer_id in offer_ids {
            let Some(offer) = self.offers.get(offer_id) else {
                return Err(MasterError::UnknownOffer(offer_id.clone()));
            };
            if &offer.framework_id != framework_id {
                // A foreign offer is indistinguishable from an unknown one.
                return Err(MasterError::UnknownOffer(offer_id.clone()));
            }
            match agent_id {
                None => agent_id = Some(&offer.agent_id),
                Some(expected) if expected != &offer.agent_id => {
                    return Err(MasterError::InvalidCall(
                        "accepted offers span multiple agents".to_owned(),
                    ));
                }
                Some(_) => {}
            }
        }
        let Some(agent_id) = agent_id else {
            return Err(MasterError::InvalidCall(
                "accept requires at least one offer".to_owned(),
            ));
        };

        let framework = self
            .frameworks
            .get(framework_id)
            .ok_or_else(|| MasterError::UnknownFramework(framework_id.clone()))?;
        let mut seen = std::collections::HashSet::new();
        for operation in operations {
            operation.validate()?;
            for task in launch_tasks(operation) {
                if task.agent_id != *agent_id {
                    return Err(MasterError::InvalidCall(format!(
                        "task {} names an agent its offers are not from",
                        task.task_id
                    )));
                }
                if !seen.insert(task.task_id.clone())
                    || framework.tasks.contains_key(&task.task_id)
                    || framework.pending_tasks.contains_key(&task.task_id)
                {
                    return Err(MasterError::InvalidCall(format!(
                        "duplicate task id {}",
                        task.task_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Continuation: authorizations gathered, apply the operations in the
    /// framework's order against the in-flight bundle.
    pub(crate) fn handle_accept_authorized(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        mut offered: Resources,
        operations: Vec<(Operation, Result<bool, AuthorizationError>)>,
        filters: Option<Filters>,
    ) {
        if !self.frameworks.contains(&framework_id) {
            // Torn down while suspended; the bundle goes back untouched.
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, None);
            return;
        }
        let agent_alive = self.agents.contains(&agent_id);

        let mut applied: Vec<Operation> = Vec::new();
        for (operation, verdict) in operations {
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    debug!(%framework_id, kind = ?operation.kind(), "operation not authorized");
                    self.fail_launches(
                        &framework_id,
                        &agent_id,
                        &operation,
                        TaskState::Error,
                        "operation not authorized",
                    );
                    continue;
                }
                Err(failure) => {
                    warn!(%framework_id, %failure, "operation authorization failed");
                    self.fail_launches(
                        &framework_id,
                        &agent_id,
                        &operation,
                        TaskState::Error,
                        "authorization backend failure",
                    );
                    continue;
                }
            }
            if !agent_alive {
                self.fail_launches(
                    &framework_id,
                    &agent_id,
                    &operation,
                    TaskState::Lost,
                    "agent removed before launch",
                );
                continue;
            }
            match operation {
                Operation::Launch { tasks } => {
                    for task in tasks {
                        self.launch_task(&framework_id, &agent_id, task, &mut offered);
                    }
                }
                Operation::LaunchGroup { executor, tasks } => {
                    self.launch_task_group(&framework_id, &agent_id, executor, tasks, &mut offered);
                }
                transform => match offered.apply(&transform) {
                    Ok(next) => {
                        offered = next;
                        self.apply_transformation_to_agent(&agent_id, &transform);
                        applied.push(transform);
                    }
                    Err(error) => {
                        warn!(%framework_id, %agent_id, %error, "discarding inapplicable operation");
                    }
                },
            }
        }

        if agent_alive && !applied.is_empty() {
            self.allocator
                .update_allocation(&framework_id, &agent_id, &applied);
        }
        if !offered.is_empty() {
            self.allocator
                .recover_resources(&framework_id, &agent_id, &offered, filters);
        }
    }

    /// Report failure for every launch task in an operation that will not
    /// run; non-launch operations are discarded quietly.
    fn fail_launches(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        operation: &Operation,
        state: TaskState,
        message: &str,
    ) {
        for task in launch_tasks(operation) {
            self.clear_pending(framework_id, agent_id, &task.task_id);
            if let Some(framework) = self.frameworks.get(framework_id) {
                let status =
                    TaskStatus::from_master(task.task_id.clone(), Some(agent_id.clone()), state)
                        .with_message(message);
                framework.send(SchedulerEvent::Update { status });
            }
        }
    }

    fn clear_pending(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        task_id: &flotilla_model::TaskId,
    ) -> bool {
        let was_pending = self
            .frameworks
            .get_mut(framework_id)
            .map(|f| f.pending_tasks.remove(task_id).is_some())
            .unwrap_or(false);
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if let Some(pending) = agent.pending_tasks.get_mut(framework_id) {
                pending.remove(task_id);
            }
        }
        was_pending
    }

    /// Launch one task against the in-flight bundle.
    fn launch_task(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        task: TaskInfo,
        offered: &mut Resources,
    ) {
        let task_id = task.task_id.clone();
        if !self.clear_pending(framework_id, agent_id, &task_id) {
            // Killed while authorization was in flight.
            if let Some(framework) = self.frameworks.get(framework_id) {
                let status = TaskStatus::from_master(
                    task_id,
                    Some(agent_id.clone()),
                    TaskState::Killed,
                )
                .with_message("task killed before delivery");
                framework.send(SchedulerEvent::Update { status });
            }
            return;
        }

        let executor_is_new = task.executor.as_ref().is_some_and(|executor| {
            self.agents
                .get(agent_id)
                .and_then(|agent| agent.executors.get(framework_id))
                .map_or(true, |executors| !executors.contains_key(&executor.executor_id))
        });
        let mut needed = task.resources.clone();
        if executor_is_new {
            if let Some(executor) = &task.executor {
                needed += executor.resources.clone();
            }
        }

        if !offered.contains(&needed) {
            if let Some(framework) = self.frameworks.get(framework_id) {
                let status = TaskStatus::from_master(
                    task_id,
                    Some(agent_id.clone()),
                    TaskState::Error,
                )
                .with_message(format!("insufficient offered resources for {needed}"));
                framework.send(SchedulerEvent::Update { status });
            }
            return;
        }
        *offered = offered.checked_sub(&needed).unwrap_or_default();

        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        if executor_is_new {
            if let Some(executor) = &task.executor {
                agent.add_executor(framework_id.clone(), executor.clone());
            }
        }
        agent.add_task(Task::staging(framework_id.clone(), task.clone()));
        agent.conn.send(AgentMessage::RunTask {
            framework_id: framework_id.clone(),
            task: task.clone(),
        });
        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            framework.tasks.insert(task_id.clone(), agent_id.clone());
        }
        self.subscribers.broadcast(MasterEvent::TaskAdded {
            framework_id: framework_id.clone(),
            task,
        });
        debug!(%framework_id, %agent_id, %task_id, "task launched");
    }

    /// Launch a task group atomically: either every task in the group
    /// launches or none does.
    fn launch_task_group(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        executor: flotilla_model::ExecutorInfo,
        tasks: Vec<TaskInfo>,
        offered: &mut Resources,
    ) {
        let mut killed: Vec<flotilla_model::TaskId> = Vec::new();
        for task in &tasks {
            if !self.clear_pending(framework_id, agent_id, &task.task_id) {
                killed.push(task.task_id.clone());
            }
        }
        if !killed.is_empty() {
            // One kill takes the whole group down.
            if let Some(framework) = self.frameworks.get(framework_id) {
                for task in &tasks {
                    let status = TaskStatus::from_master(
                        task.task_id.clone(),
                        Some(agent_id.clone()),
                        TaskState::Killed,
                    )
                    .with_message("a task in the group was killed before delivery");
                    framework.send(SchedulerEvent::Update { status });
                }
            }
            return;
        }

        let executor_is_new = self
            .agents
            .get(agent_id)
            .and_then(|agent| agent.executors.get(framework_id))
            .map_or(true, |executors| !executors.contains_key(&executor.executor_id));
        let mut needed = tasks
            .iter()
            .fold(Resources::empty(), |acc, t| acc + t.resources.clone());
        if executor_is_new {
            needed += executor.resources.clone();
        }

        if !offered.contains(&needed) {
            if let Some(framework) = self.frameworks.get(framework_id) {
                for task in &tasks {
                    let status = TaskStatus::from_master(
                        task.task_id.clone(),
                        Some(agent_id.clone()),
                        TaskState::Error,
                    )
                    .with_message("insufficient offered resources for task group");
                    framework.send(SchedulerEvent::Update { status });
                }
            }
            return;
        }
        *offered = offered.checked_sub(&needed).unwrap_or_default();

        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        if executor_is_new {
            agent.add_executor(framework_id.clone(), executor.clone());
        }
        for task in &tasks {
            agent.add_task(Task::staging(framework_id.clone(), task.clone()));
        }
        agent.conn.send(AgentMessage::RunTaskGroup {
            framework_id: framework_id.clone(),
            executor,
            tasks: tasks.clone(),
        });
        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            for task in &tasks {
                framework
                    .tasks
                    .insert(task.task_id.clone(), agent_id.clone());
            }
        }
        for task in tasks {
            self.subscribers.broadcast(MasterEvent::TaskAdded {
                framework_id: framework_id.clone(),
                task,
            });
        }
    }

    /// Apply a reservation or volume operation to the agent's durable
    /// view and tell the agent to checkpoint it.
    ///
    /// The master believes the checkpoint is in effect before the agent
    /// confirms; this weak consistency is intended.
    pub(crate) fn apply_transformation_to_agent(&mut self, agent_id: &AgentId, operation: &Operation) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        match agent.total.apply(operation) {
            Ok(total) => agent.total = total,
            Err(error) => {
                warn!(%agent_id, %error, "operation does not fit agent totals, skipping");
                return;
            }
        }
        agent.checkpointed = updated_checkpointed(&agent.checkpointed, operation);
        let total = agent.total.clone();
        if agent.connected {
            agent.conn.send(AgentMessage::CheckpointResources {
                checkpointed: agent.checkpointed.clone(),
            });
        }
        self.allocator.update_agent(agent_id, &total);
    }

    // -- inverse offer answers ---------------------------------------------

    pub(crate) fn handle_inverse_offer_answer(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        inverse_offer_ids: Vec<InverseOfferId>,
        accepted: bool,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        let state = if accepted {
            flotilla_model::InverseOfferState::Accepted
        } else {
            flotilla_model::InverseOfferState::Declined
        };
        for inverse_offer_id in inverse_offer_ids {
            let owned = self
                .offers
                .get_inverse(&inverse_offer_id)
                .is_some_and(|inverse| inverse.framework_id == framework_id);
            if !owned {
                debug!(%inverse_offer_id, "ignoring answer for unknown inverse offer");
                continue;
            }
            let Some(inverse) = self.discard_inverse_offer(&inverse_offer_id, false) else {
                continue;
            };
            if let Some(machine_id) = self
                .agents
                .get(&inverse.agent_id)
                .map(|agent| agent.info.machine_id())
            {
                self.machines
                    .record_inverse_offer_answer(&machine_id, framework_id.clone(), state);
            }
        }
    }
}

/// The checkpointed view after a reservation or volume operation.
fn updated_checkpointed(checkpointed: &Resources, operation: &Operation) -> Resources {
    match operation {
        Operation::Reserve { resources } => checkpointed.clone() + resources.clone(),
        Operation::Unreserve { resources } => {
            checkpointed.checked_sub(resources).unwrap_or_else(|error| {
                warn!(%error, "unreserve of resources that were not checkpointed");
                checkpointed.clone()
            })
        }
        Operation::Create { volumes } => match checkpointed.checked_sub(&volumes.without_volumes())
        {
            // Dynamically reserved disk: swap the plain flavor for the
            // volume flavor.
            Ok(base) => base + volumes.clone(),
            // Statically reserved disk: only the volume is checkpointed.
            Err(_) => checkpointed.clone() + volumes.clone(),
        },
        Operation::Destroy { volumes } => match checkpointed.checked_sub(volumes) {
            Ok(rest) => rest + volumes.without_volumes(),
            Err(error) => {
                warn!(%error, "destroy of volumes that were not checkpointed");
                checkpointed.clone()
            }
        },
        Operation::Launch { .. } | Operation::LaunchGroup { .. } => checkpointed.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_model::resources::{Resource, DISK};
    use flotilla_model::Volume;

    #[test]
    fn test_updated_checkpointed_reserve_unreserve_round_trip() {
        let reserved =
            Resources::from_entries(vec![Resource::scalar("cpus", 2.0).with_role("web")]);
        let after_reserve = updated_checkpointed(
            &Resources::empty(),
            &Operation::Reserve {
                resources: reserved.clone(),
            },
        );
        assert_eq!(after_reserve, reserved);

        let after_unreserve = updated_checkpointed(
            &after_reserve,
            &Operation::Unreserve {
                resources: reserved,
            },
        );
        assert!(after_unreserve.is_empty());
    }

    #[test]
    fn test_updated_checkpointed_create_swaps_dynamic_reservation() {
        let plain = Resources::from_entries(vec![Resource::scalar(DISK, 10.0).with_role("db")]);
        let volumes = Resources::from_entries(vec![Resource::scalar(DISK, 10.0)
            .with_role("db")
            .with_volume(Volume::new("v1", "/data"))]);

        let after_create =
            updated_checkpointed(&plain, &Operation::Create { volumes: volumes.clone() });
        assert_eq!(after_create, volumes);

        let after_destroy = updated_checkpointed(&after_create, &Operation::Destroy { volumes });
        assert_eq!(after_destroy, plain);
    }

    #[test]
    fn test_updated_checkpointed_create_on_static_reservation() {
        let volumes = Resources::from_entries(vec![Resource::scalar(DISK, 10.0)
            .with_role("db")
            .with_volume(Volume::new("v1", "/data"))]);
        let after = updated_checkpointed(&Resources::empty(), &Operation::Create {
            volumes: volumes.clone(),
        });
        assert_eq!(after, volumes);
    }
}
