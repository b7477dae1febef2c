//! Framework lifecycle orchestration.
//!
//! Subscription is authorization-gated; failover rebinds the transport
//! variant wholesale (HTTP and pid connections upgrade/downgrade freely);
//! a framework whose failover timer expires before re-subscription is torn
//! down and retained only in the completed ring.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use chrono::Utc;
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use crate::allocator::Allocator;
use crate::auth::{Action, Authenticator, AuthorizationError, Authorizer};
use crate::error::MasterError;
use crate::event::{Event, SchedulerConn};
use crate::master::Master;
use crate::roster::{Framework, FrameworkTransport};
use flotilla_model::{
    AgentId, AgentMessage, ExecutorId, FrameworkId, FrameworkInfo, MasterEvent, PeerAddr,
    ResourceRequest, Resources, SchedulerEvent,
};

impl<A, R, Z, N> Master<A, R, Z, N>
where
    A: Allocator,
    R: flotilla_registrar::Registrar,
    Z: Authorizer,
    N: Authenticator,
{
    /// Validate that a call claiming `framework_id` arrived over that
    /// framework's registered transport.
    pub(crate) fn framework_checked(
        &self,
        framework_id: &FrameworkId,
        peer: &PeerAddr,
    ) -> Result<(), MasterError> {
        let Some(framework) = self.frameworks.get(framework_id) else {
            return Err(MasterError::UnknownFramework(framework_id.clone()));
        };
        if framework.transport.peer() != peer {
            return Err(MasterError::InvalidCall(format!(
                "call for framework {framework_id} from an unregistered connection"
            )));
        }
        Ok(())
    }

    // -- subscribe ---------------------------------------------------------

    pub(crate) fn handle_subscribe(
        &mut self,
        conn: SchedulerConn,
        framework: FrameworkInfo,
        framework_id: Option<FrameworkId>,
        principal: Option<String>,
    ) {
        if framework.roles.is_empty() {
            conn.send(SchedulerEvent::Error {
                message: "framework must subscribe under at least one role".to_owned(),
            });
            return;
        }
        if let Some(role) = framework.roles.iter().find(|r| !self.roles.permitted(r)) {
            conn.send(SchedulerEvent::Error {
                message: format!("role {role} is not whitelisted"),
            });
            return;
        }
        // An authenticated connection may not claim someone else's
        // principal.
        if let Some(Some(authenticated)) = self.auth.principal(&conn.peer) {
            if let Some(claimed) = &framework.principal {
                if claimed != authenticated {
                    conn.send(SchedulerEvent::Error {
                        message: format!(
                            "framework principal {claimed} does not match authenticated principal"
                        ),
                    });
                    return;
                }
            }
        }

        let request = Self::authorization(
            principal.clone(),
            Action::RegisterFramework {
                roles: framework.roles.clone(),
            },
        );
        self.submit_authorization(request, move |result| Event::SubscribeAuthorized {
            conn,
            principal,
            framework,
            framework_id,
            result,
        });
    }

    pub(crate) fn handle_subscribe_authorized(
        &mut self,
        conn: SchedulerConn,
        _principal: Option<String>,
        framework: FrameworkInfo,
        framework_id: Option<FrameworkId>,
        result: Result<bool, AuthorizationError>,
    ) {
        match result {
            Err(failure) => {
                // Transient backend failure: drop without deactivating the
                // caller; the framework may retry.
                warn!(peer = %conn.peer, %failure, "subscribe authorization failed, dropping call");
            }
            Ok(false) => {
                conn.send(SchedulerEvent::Error {
                    message: format!(
                        "framework {} is not authorized to register",
                        framework.name
                    ),
                });
            }
            Ok(true) => match framework_id {
                None => self.install_new_framework(conn, framework),
                Some(framework_id) => {
                    if self.frameworks.contains(&framework_id) {
                        self.resubscribe_framework(framework_id, conn, framework);
                    } else if self.frameworks.recovered.contains_key(&framework_id) {
                        self.install_recovered_framework(framework_id, conn, framework);
                    } else if self.frameworks.is_completed(&framework_id) {
                        conn.send(SchedulerEvent::Error {
                            message: format!("framework {framework_id} has been torn down"),
                        });
                    } else {
                        conn.send(SchedulerEvent::Error {
                            message: format!("unknown framework id {framework_id}"),
                        });
                    }
                }
            },
        }
    }

    fn install_new_framework(&mut self, conn: SchedulerConn, info: FrameworkInfo) {
        let framework_id = FrameworkId::generate(&self.id, self.next_framework_seq);
        self.next_framework_seq += 1;
        let epoch = self.bump_epoch();

        let transport = FrameworkTransport::for_conn(conn, self.config.heartbeat_interval);
        let framework = Framework::new(framework_id.clone(), info.clone(), transport, epoch);

        for role in self.roles.subscribe(&framework_id, &info.roles) {
            self.allocator.add_role(&role);
        }
        self.allocator
            .add_framework(&framework_id, &info, &HashMap::new(), true);

        framework.send(SchedulerEvent::Subscribed {
            framework_id: framework_id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        });
        self.frameworks.insert(framework);
        self.subscribers.broadcast(MasterEvent::FrameworkAdded {
            framework_id: framework_id.clone(),
            framework: info,
        });
        info!(%framework_id, "framework registered");
    }

    /// Failover or reconnect of a live framework: the new transport wins,
    /// pending tasks stay pending, outstanding offers stay outstanding.
    fn resubscribe_framework(
        &mut self,
        framework_id: FrameworkId,
        conn: SchedulerConn,
        info: FrameworkInfo,
    ) {
        let epoch = self.bump_epoch();
        let heartbeat_interval = self.config.heartbeat_interval;
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let old_roles = framework.info.roles.clone();
        let was_active = framework.active;

        // Replacing the variant tears down the old heartbeater and closes
        // the old transport.
        framework.transport = FrameworkTransport::for_conn(conn, heartbeat_interval);
        framework.connected = true;
        framework.active = true;
        framework.epoch = epoch;
        framework.reregistered_at = Some(Utc::now());
        framework.info = info.clone();
        framework.send(SchedulerEvent::Subscribed {
            framework_id: framework_id.clone(),
            heartbeat_interval,
        });

        for role in self.roles.subscribe(&framework_id, &info.roles) {
            self.allocator.add_role(&role);
        }
        let dropped_roles: Vec<String> = old_roles
            .iter()
            .filter(|role| !info.roles.contains(role))
            .cloned()
            .collect();
        for role in self.roles.unsubscribe(&framework_id, &dropped_roles) {
            self.allocator.remove_role(&role);
        }

        if !was_active {
            self.allocator.activate_framework(&framework_id);
        }
        self.subscribers.broadcast(MasterEvent::FrameworkUpdated {
            framework_id: framework_id.clone(),
            framework: info,
        });
        info!(%framework_id, "framework re-subscribed");
    }

    /// A framework known only from re-registering agents subscribes with
    /// its old id after a master failover.
    fn install_recovered_framework(
        &mut self,
        framework_id: FrameworkId,
        conn: SchedulerConn,
        info: FrameworkInfo,
    ) {
        self.frameworks.recovered.remove(&framework_id);
        let epoch = self.bump_epoch();
        let transport = FrameworkTransport::for_conn(conn, self.config.heartbeat_interval);
        let mut framework = Framework::new(framework_id.clone(), info.clone(), transport, epoch);

        // Its tasks are already in the agent arena; adopt the index and
        // reconstruct per-agent usage for the allocator.
        let mut used: HashMap<AgentId, Resources> = HashMap::new();
        for agent in self.agents.iter() {
            if let Some(tasks) = agent.tasks.get(&framework_id) {
                for task_id in tasks.keys() {
                    framework.tasks.insert(task_id.clone(), agent.id.clone());
                }
            }
            let agent_used = agent.used_by(&framework_id);
            if !agent_used.is_empty() {
                used.insert(agent.id.clone(), agent_used);
            }
        }

        for role in self.roles.subscribe(&framework_id, &info.roles) {
            self.allocator.add_role(&role);
        }
        self.allocator
            .add_framework(&framework_id, &info, &used, true);

        framework.send(SchedulerEvent::Subscribed {
            framework_id: framework_id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        });
        self.frameworks.insert(framework);
        self.subscribers.broadcast(MasterEvent::FrameworkAdded {
            framework_id: framework_id.clone(),
            framework: info,
        });
        info!(%framework_id, "recovered framework re-subscribed");
    }

    // -- disconnection and failover ---------------------------------------

    pub(crate) fn handle_scheduler_disconnected(&mut self, peer: PeerAddr) {
        self.auth.forget(&peer);
        let Some(framework_id) = self.frameworks.id_by_peer(&peer) else {
            return;
        };
        let epoch = self.bump_epoch();
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        if !framework.connected {
            return;
        }
        framework.connected = false;
        framework.active = false;
        framework.epoch = epoch;
        let timeout = framework.failover_timeout(self.config.framework_failover_timeout);
        info!(%framework_id, ?timeout, "framework disconnected, failover timer armed");

        // Offers stay outstanding: a quick re-subscription resumes with
        // them intact.
        self.allocator.deactivate_framework(&framework_id);
        self.post_after(
            timeout,
            Event::FrameworkFailoverExpired {
                framework_id,
                epoch,
            },
        );
    }

    pub(crate) fn handle_framework_failover_expired(
        &mut self,
        framework_id: FrameworkId,
        epoch: u64,
    ) {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            return;
        };
        if framework.connected || framework.epoch != epoch {
            // Re-subscribed in time; this timer is stale.
            return;
        }
        info!(%framework_id, "framework failover timeout expired");
        self.remove_framework(&framework_id, "framework failover timeout");
    }

    // -- teardown ----------------------------------------------------------

    pub(crate) fn handle_teardown(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        principal: Option<String>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        let request = Self::authorization(
            principal,
            Action::TeardownFramework {
                framework_id: framework_id.clone(),
            },
        );
        self.submit_authorization(request, move |result| Event::TeardownAuthorized {
            framework_id,
            result,
        });
    }

    pub(crate) fn handle_teardown_authorized(
        &mut self,
        framework_id: FrameworkId,
        result: Result<bool, AuthorizationError>,
    ) {
        if !self.frameworks.contains(&framework_id) {
            return;
        }
        match result {
            Err(failure) => {
                warn!(%framework_id, %failure, "teardown authorization failed, dropping call");
            }
            Ok(false) => {
                if let Some(framework) = self.frameworks.get(&framework_id) {
                    framework.send(SchedulerEvent::Error {
                        message: "not authorized to tear down this framework".to_owned(),
                    });
                }
            }
            Ok(true) => {
                info!(%framework_id, "framework torn down");
                self.remove_framework(&framework_id, "framework torn down");
            }
        }
    }

    /// Tear a framework down completely: kill its workload everywhere,
    /// pull back its offers, recover its resources, and retain it in the
    /// completed ring.
    pub(crate) fn remove_framework(&mut self, framework_id: &FrameworkId, reason: &str) {
        let Some(mut framework) = self.frameworks.remove(framework_id) else {
            return;
        };
        debug!(%framework_id, reason, "removing framework");

        let offer_ids: Vec<_> = framework.offers.drain().collect();
        for offer_id in offer_ids {
            if let Some(offer) = self.discard_offer(&offer_id, false) {
                self.allocator.recover_resources(
                    framework_id,
                    &offer.agent_id,
                    &offer.resources,
                    None,
                );
            }
        }
        let inverse_ids: Vec<_> = framework.inverse_offers.drain().collect();
        for inverse_offer_id in inverse_ids {
            self.discard_inverse_offer(&inverse_offer_id, false);
        }

        // Kill the workload agent by agent.
        let mut touched_agents: HashSet<AgentId> = HashSet::new();
        for (task_id, agent_id) in framework.tasks.drain() {
            touched_agents.insert(agent_id.clone());
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                if let Some(task) = agent.remove_task(framework_id, &task_id) {
                    if task.resources_charged {
                        self.allocator.recover_resources(
                            framework_id,
                            &agent_id,
                            &task.info.resources,
                            None,
                        );
                    }
                }
            }
        }
        for agent_id in self.agents.ids() {
            let Some(agent) = self.agents.get_mut(&agent_id) else {
                continue;
            };
            let executor_ids: Vec<ExecutorId> = agent
                .executors
                .get(framework_id)
                .map(|executors| executors.keys().cloned().collect())
                .unwrap_or_default();
            for executor_id in executor_ids {
                touched_agents.insert(agent_id.clone());
                if let Some(executor) = agent.remove_executor(framework_id, &executor_id) {
                    self.allocator.recover_resources(
                        framework_id,
                        &agent_id,
                        &executor.resources,
                        None,
                    );
                }
            }
        }
        for agent_id in &touched_agents {
            if let Some(agent) = self.agents.get(agent_id) {
                if agent.connected {
                    agent.conn.send(AgentMessage::ShutdownFramework {
                        framework_id: framework_id.clone(),
                    });
                }
            }
        }

        for (task_id, agent_id) in framework.pending_tasks.drain() {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                if let Some(pending) = agent.pending_tasks.get_mut(framework_id) {
                    pending.remove(&task_id);
                }
            }
        }

        self.pending_acks.retain(|(_, id, _), _| id != framework_id);
        for remembered in self.unreachable_tasks.values_mut() {
            remembered.remove(framework_id);
        }

        for role in self.roles.unsubscribe(framework_id, &framework.info.roles) {
            self.allocator.remove_role(&role);
        }
        self.allocator.remove_framework(framework_id);

        self.subscribers.broadcast(MasterEvent::FrameworkRemoved {
            framework_id: framework_id.clone(),
        });
        self.frameworks.complete(framework);
    }

    // -- offer suppression and requests ------------------------------------

    pub(crate) fn handle_revive(&mut self, conn: SchedulerConn, framework_id: FrameworkId) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        debug!(%framework_id, "reviving offers");
        self.allocator.revive_offers(&framework_id);
    }

    pub(crate) fn handle_suppress(&mut self, conn: SchedulerConn, framework_id: FrameworkId) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        debug!(%framework_id, "suppressing offers");
        self.allocator.suppress_offers(&framework_id);
    }

    pub(crate) fn handle_request(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        self.allocator.request_resources(&framework_id, &requests);
    }

    // -- executor messaging -------------------------------------------------

    pub(crate) fn handle_framework_to_executor(
        &mut self,
        conn: SchedulerConn,
        framework_id: FrameworkId,
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) {
        if let Err(error) = self.framework_checked(&framework_id, &conn.peer) {
            conn.send(SchedulerEvent::Error {
                message: error.to_string(),
            });
            return;
        }
        let Some(agent) = self.agents.get(&agent_id) else {
            conn.send(SchedulerEvent::Error {
                message: MasterError::UnknownAgent(agent_id).to_string(),
            });
            return;
        };
        if !agent.connected {
            debug!(%agent_id, "dropping framework message for disconnected agent");
            return;
        }
        agent.conn.send(AgentMessage::FrameworkMessage {
            framework_id,
            executor_id,
            data,
        });
    }

    pub(crate) fn handle_executor_to_framework(
        &mut self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            debug!(%framework_id, "dropping executor message for unknown framework");
            return;
        };
        framework.send(SchedulerEvent::Message {
            agent_id,
            executor_id,
            data,
        });
    }
}
