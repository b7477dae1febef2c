//! Shared harness for master integration tests: an in-process cluster
//! with a manual allocator, in-memory registrar, and channel-backed agent
//! and scheduler endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(dead_code)] // not every test file uses every helper

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use flotilla_master::allocator::{ManualAllocator, ManualAllocatorHandle};
use flotilla_master::auth::{PermissiveAuthorizer, StaticAuthenticator};
use flotilla_master::config::MasterConfig;
use flotilla_master::error::MasterError;
use flotilla_master::event::{AgentConn, ConnectionKind, SchedulerConn};
use flotilla_master::master::{Master, MasterHandle};
use flotilla_model::{
    AgentCall, AgentId, AgentInfo, AgentMessage, AgentTask, Filters, FrameworkId, FrameworkInfo,
    Offer, OperatorCall, OperatorResponse, PeerAddr, Resources, SchedulerCall, SchedulerEvent,
    StateSnapshot, TaskStatus,
};
use flotilla_registrar::InMemoryRegistrar;

/// One in-process master with its collaborators.
pub struct TestCluster {
    pub handle: MasterHandle,
    pub allocator: ManualAllocatorHandle,
    pub registrar: InMemoryRegistrar,
    pub master_task: JoinHandle<Result<(), MasterError>>,
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestCluster {
    pub fn start() -> Self {
        Self::start_with(MasterConfig::default())
    }

    pub fn start_with(config: MasterConfig) -> Self {
        Self::start_with_auth(config, StaticAuthenticator::new())
    }

    pub fn start_with_auth(config: MasterConfig, authenticator: StaticAuthenticator) -> Self {
        init_tracing();
        let (allocator, allocator_handle) = ManualAllocator::new();
        let registrar = InMemoryRegistrar::default();
        let (master, handle) = Master::new(
            config,
            allocator,
            registrar.clone(),
            PermissiveAuthorizer,
            authenticator,
        )
        .expect("valid test config");
        let master_task = tokio::spawn(master.run());
        Self {
            handle,
            allocator: allocator_handle,
            registrar,
            master_task,
        }
    }

    /// Wait until all in-flight work (spawned commits, authorizations and
    /// their continuation events) has drained.
    pub async fn settle(&self) {
        for _ in 0..3 {
            let _ = self
                .handle
                .operator_call(None, OperatorCall::GetHealth)
                .await;
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
        }
    }

    pub async fn state(&self) -> StateSnapshot {
        let reply = self
            .handle
            .operator_call(None, OperatorCall::GetState)
            .await
            .expect("master running");
        match reply.response.expect("state snapshot") {
            OperatorResponse::State { state } => state,
            other => panic!("expected state snapshot, got {other:?}"),
        }
    }

    pub async fn operator(&self, call: OperatorCall) -> Result<OperatorResponse, MasterError> {
        self.handle
            .operator_call(None, call)
            .await
            .expect("master running")
            .response
    }
}

/// Check the quantified resource invariants on a snapshot: at every
/// quiescent point an agent's total covers its used plus offered view.
pub fn assert_resource_invariants(state: &StateSnapshot) {
    for agent in &state.agents {
        let used = agent
            .used
            .iter()
            .fold(Resources::empty(), |acc, (_, r)| acc + r.clone());
        let committed = used + agent.offered.clone();
        assert!(
            agent.total.contains(&committed),
            "agent {:?} is overcommitted: total {} < committed {}",
            agent.agent.id,
            agent.total,
            committed
        );
    }
}

/// A fake agent endpoint: an address plus the channel the master sends
/// agent messages to.
pub struct TestAgent {
    pub peer: PeerAddr,
    pub conn: AgentConn,
    pub hostname: String,
    pub resources: Resources,
    rx: mpsc::UnboundedReceiver<AgentMessage>,
}

impl TestAgent {
    pub fn new(hostname: &str, ip: &str, resources: Resources) -> Self {
        let peer = PeerAddr::new(format!("{ip}:5051"));
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            conn: AgentConn::new(peer.clone(), tx),
            peer,
            hostname: hostname.to_owned(),
            resources,
            rx,
        }
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo::new(
            self.hostname.clone(),
            self.peer.clone(),
            self.resources.clone(),
        )
    }

    pub fn register(&self, cluster: &TestCluster) {
        cluster.handle.agent_call(
            self.conn.clone(),
            AgentCall::Register {
                agent: self.info(),
                checkpointed: Resources::empty(),
                version: "0.1.0".to_owned(),
            },
        );
    }

    pub fn reregister(&self, cluster: &TestCluster, agent_id: &AgentId, tasks: Vec<AgentTask>) {
        cluster.handle.agent_call(
            self.conn.clone(),
            AgentCall::Reregister {
                agent: self.info().with_id(agent_id.clone()),
                checkpointed: Resources::empty(),
                executors: Vec::new(),
                tasks,
                frameworks: Vec::new(),
                completed_frameworks: Vec::new(),
                version: "0.1.0".to_owned(),
            },
        );
    }

    /// Replace the transport, as an agent restart would.
    pub fn reconnect(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn = AgentConn::new(self.peer.clone(), tx);
        self.rx = rx;
    }

    pub async fn recv(&mut self) -> AgentMessage {
        tokio::time::timeout(Duration::from_secs(120), self.rx.recv())
            .await
            .expect("timed out waiting for an agent message")
            .expect("agent channel closed")
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        self.rx.try_recv().ok()
    }

    pub async fn expect_registered(&mut self) -> AgentId {
        match self.recv().await {
            AgentMessage::Registered { agent_id } => agent_id,
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    pub async fn expect_reregistered(&mut self) -> AgentId {
        match self.recv().await {
            AgentMessage::Reregistered { agent_id } => agent_id,
            other => panic!("expected Reregistered, got {other:?}"),
        }
    }
}

/// A fake scheduler endpoint over a pid-style connection.
pub struct TestScheduler {
    pub peer: PeerAddr,
    pub conn: SchedulerConn,
    rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl TestScheduler {
    pub fn new(addr: &str) -> Self {
        Self::with_kind(addr, ConnectionKind::Pid)
    }

    pub fn with_kind(addr: &str, kind: ConnectionKind) -> Self {
        let peer = PeerAddr::new(addr);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            conn: SchedulerConn::new(peer.clone(), kind, tx),
            peer,
            rx,
        }
    }

    pub fn call(&self, cluster: &TestCluster, call: SchedulerCall) {
        cluster.handle.scheduler_call(self.conn.clone(), call);
    }

    pub fn subscribe(&self, cluster: &TestCluster, framework: FrameworkInfo) {
        self.call(
            cluster,
            SchedulerCall::Subscribe {
                framework,
                framework_id: None,
            },
        );
    }

    pub fn resubscribe(
        &self,
        cluster: &TestCluster,
        framework: FrameworkInfo,
        framework_id: FrameworkId,
    ) {
        self.call(
            cluster,
            SchedulerCall::Subscribe {
                framework,
                framework_id: Some(framework_id),
            },
        );
    }

    /// Next event, skipping heartbeats.
    pub async fn recv(&mut self) -> SchedulerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(120), self.rx.recv())
                .await
                .expect("timed out waiting for a scheduler event")
                .expect("scheduler channel closed");
            if !matches!(event, SchedulerEvent::Heartbeat) {
                return event;
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.rx.try_recv().ok()? {
                SchedulerEvent::Heartbeat => continue,
                event => return Some(event),
            }
        }
    }

    pub async fn expect_subscribed(&mut self) -> FrameworkId {
        match self.recv().await {
            SchedulerEvent::Subscribed { framework_id, .. } => framework_id,
            other => panic!("expected Subscribed, got {other:?}"),
        }
    }

    pub async fn expect_offers(&mut self) -> Vec<Offer> {
        match self.recv().await {
            SchedulerEvent::Offers { offers } => offers,
            other => panic!("expected Offers, got {other:?}"),
        }
    }

    pub async fn expect_update(&mut self) -> TaskStatus {
        match self.recv().await {
            SchedulerEvent::Update { status } => status,
            other => panic!("expected Update, got {other:?}"),
        }
    }

    pub async fn expect_error(&mut self) -> String {
        match self.recv().await {
            SchedulerEvent::Error { message } => message,
            other => panic!("expected Error, got {other:?}"),
        }
    }
}

/// Offer exactly `resources` on `agent_id` to `framework_id`.
pub fn offer_one(
    cluster: &TestCluster,
    framework_id: &FrameworkId,
    agent_id: &AgentId,
    resources: Resources,
) {
    let mut offers = HashMap::new();
    offers.insert(agent_id.clone(), resources);
    assert!(cluster.allocator.offer(framework_id.clone(), offers));
}

/// Shorthand accept with a single launch.
pub fn accept_launch(
    cluster: &TestCluster,
    scheduler: &TestScheduler,
    framework_id: &FrameworkId,
    offer: &Offer,
    task: flotilla_model::TaskInfo,
) {
    scheduler.call(
        cluster,
        SchedulerCall::Accept {
            framework_id: framework_id.clone(),
            offer_ids: vec![offer.id.clone()],
            operations: vec![flotilla_model::Operation::Launch { tasks: vec![task] }],
            filters: None,
        },
    );
}

/// Shorthand for a plain decline.
pub fn decline(
    cluster: &TestCluster,
    scheduler: &TestScheduler,
    framework_id: &FrameworkId,
    offer: &Offer,
    filters: Option<Filters>,
) {
    scheduler.call(
        cluster,
        SchedulerCall::Decline {
            framework_id: framework_id.clone(),
            offer_ids: vec![offer.id.clone()],
            filters,
        },
    );
}
