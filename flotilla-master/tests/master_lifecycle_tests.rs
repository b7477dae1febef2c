//! End-to-end agent and framework lifecycle scenarios, driven through the
//! full master actor with an in-memory registrar.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use common::{assert_resource_invariants, offer_one, TestAgent, TestCluster, TestScheduler};
use flotilla_master::allocator::AllocatorCall;
use flotilla_master::config::MasterConfig;
use flotilla_master::error::MasterError;
use flotilla_registrar::Registrar;
use flotilla_model::{
    AgentId, AgentMessage, FrameworkInfo, Operation, OperatorCall, Resources, SchedulerCall,
    TaskId, TaskInfo, TaskState,
};

fn node_resources() -> Resources {
    Resources::cpus(4.0) + Resources::mem(8192.0)
}

#[tokio::test(start_paused = true)]
async fn agent_first_registration() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());

    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;
    cluster.settle().await;

    // Admission is durable.
    let registry = cluster.registrar.recover().await.unwrap();
    assert!(registry.is_admitted(&agent_id));

    // The allocator learned about the agent with its full resources.
    assert!(cluster
        .allocator
        .calls()
        .contains(&AllocatorCall::AddAgent(agent_id.clone(), node_resources())));

    // In-memory view: connected and active.
    let state = cluster.state().await;
    assert_eq!(state.agents.len(), 1);
    assert!(state.agents[0].connected);
    assert!(state.agents[0].active);
    assert_eq!(state.agents[0].total, node_resources());
    assert_resource_invariants(&state);
}

#[tokio::test(start_paused = true)]
async fn duplicate_registration_resends_ack() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());

    agent.register(&cluster);
    let first = agent.expect_registered().await;

    // The agent retries because its ack was lost.
    agent.register(&cluster);
    let second = agent.expect_registered().await;
    assert_eq!(first, second);

    cluster.settle().await;
    assert_eq!(cluster.state().await.agents.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn agent_partition_marks_unreachable_and_reconciles_on_return() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;

    offer_one(
        &cluster,
        &framework_id,
        &agent_id,
        Resources::cpus(2.0) + Resources::mem(4096.0),
    );
    let offers = scheduler.expect_offers().await;
    common::accept_launch(
        &cluster,
        &scheduler,
        &framework_id,
        &offers[0],
        TaskInfo::new(
            TaskId::new("t1"),
            "t1",
            agent_id.clone(),
            Resources::cpus(1.0) + Resources::mem(2048.0),
        ),
    );
    assert!(matches!(agent.recv().await, AgentMessage::RunTask { .. }));
    cluster.settle().await;

    // The agent partitions away and stays silent past the window.
    cluster.handle.agent_disconnected(agent.peer.clone());
    cluster.settle().await;
    tokio::time::advance(Duration::from_secs(11 * 60)).await;
    cluster.settle().await;

    // The framework was told its task is lost.
    let status = scheduler.expect_update().await;
    assert_eq!(status.task_id, TaskId::new("t1"));
    assert_eq!(status.state, TaskState::Lost);

    // Unreachability is durable and the live roster dropped the agent.
    let registry = cluster.registrar.recover().await.unwrap();
    assert!(registry.is_unreachable(&agent_id));
    assert!(!registry.is_admitted(&agent_id));
    let state = cluster.state().await;
    assert!(state.agents.is_empty());
    assert_eq!(state.unreachable_agents.len(), 1);

    // The agent comes back without t1: the master re-admits it and kills
    // the straggler it still remembers.
    agent.reconnect();
    agent.reregister(&cluster, &agent_id, Vec::new());
    assert_eq!(agent.expect_reregistered().await, agent_id);
    match agent.recv().await {
        AgentMessage::KillTask {
            framework_id: kill_framework,
            task_id,
        } => {
            assert_eq!(kill_framework, framework_id);
            assert_eq!(task_id, TaskId::new("t1"));
        }
        other => panic!("expected KillTask, got {other:?}"),
    }
    cluster.settle().await;

    let registry = cluster.registrar.recover().await.unwrap();
    assert!(registry.is_admitted(&agent_id));
    assert!(!registry.is_unreachable(&agent_id));
    assert_resource_invariants(&cluster.state().await);
}

#[tokio::test(start_paused = true)]
async fn agent_rebind_new_address_wins() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;
    cluster.settle().await;

    // The agent restarts behind a new address and re-registers.
    let mut moved = TestAgent::new("a1", "10.0.0.2", node_resources());
    moved.reregister(&cluster, &agent_id, Vec::new());
    assert_eq!(moved.expect_reregistered().await, agent_id);
    cluster.settle().await;

    let state = cluster.state().await;
    assert_eq!(state.agents.len(), 1);
    assert_eq!(
        state.agents[0].agent.address.as_str(),
        "10.0.0.2:5051"
    );
}

#[tokio::test(start_paused = true)]
async fn removed_agent_is_refused_on_reregistration() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;
    cluster.settle().await;

    let response = cluster
        .operator(OperatorCall::MarkAgentGone {
            agent_id: agent_id.clone(),
        })
        .await;
    assert!(response.is_ok());
    assert!(matches!(agent.recv().await, AgentMessage::Shutdown { .. }));
    cluster.settle().await;

    // A stale agent re-registering with a tombstoned id is shut down.
    agent.reconnect();
    agent.reregister(&cluster, &agent_id, Vec::new());
    assert!(matches!(agent.recv().await, AgentMessage::Shutdown { .. }));

    let registry = cluster.registrar.recover().await.unwrap();
    assert!(!registry.is_admitted(&agent_id));
}

#[tokio::test(start_paused = true)]
async fn strict_registry_refuses_unknown_agents() {
    let config = MasterConfig::builder()
        .with_registry_strict(true)
        .build()
        .unwrap();
    let cluster = TestCluster::start_with(config);

    let mut stranger = TestAgent::new("ghost", "10.0.0.9", node_resources());
    stranger.reregister(&cluster, &AgentId::new("never-admitted"), Vec::new());
    assert!(matches!(stranger.recv().await, AgentMessage::Shutdown { .. }));
}

#[tokio::test(start_paused = true)]
async fn lenient_registry_readmits_unknown_agents() {
    let cluster = TestCluster::start();

    // Not strict: an unknown id is re-admitted (its registry metadata may
    // simply have been garbage collected).
    let mut returnee = TestAgent::new("old", "10.0.0.9", node_resources());
    let old_id = AgentId::new("some-previous-master-S3");
    returnee.reregister(&cluster, &old_id, Vec::new());
    assert_eq!(returnee.expect_reregistered().await, old_id);

    cluster.settle().await;
    let registry = cluster.registrar.recover().await.unwrap();
    assert!(registry.is_admitted(&old_id));
}

#[tokio::test(start_paused = true)]
async fn framework_failover_rebinds_transport() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    let info = FrameworkInfo::new("web", "web-role")
        .with_failover_timeout(Duration::from_secs(300));
    scheduler.subscribe(&cluster, info.clone());
    let framework_id = scheduler.expect_subscribed().await;

    offer_one(&cluster, &framework_id, &agent_id, Resources::cpus(2.0));
    let offers = scheduler.expect_offers().await;
    common::accept_launch(
        &cluster,
        &scheduler,
        &framework_id,
        &offers[0],
        TaskInfo::new(TaskId::new("t1"), "t1", agent_id.clone(), Resources::cpus(1.0)),
    );
    assert!(matches!(agent.recv().await, AgentMessage::RunTask { .. }));
    cluster.settle().await;

    // Transport closes; a new connection re-subscribes within the window.
    cluster.handle.scheduler_disconnected(scheduler.peer.clone());
    cluster.settle().await;
    tokio::time::advance(Duration::from_secs(3 * 60)).await;

    let mut replacement = TestScheduler::new("10.9.0.2:36000");
    replacement.resubscribe(&cluster, info, framework_id.clone());
    assert_eq!(replacement.expect_subscribed().await, framework_id);
    cluster.settle().await;

    // The task survived the failover untouched.
    let state = cluster.state().await;
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].task_id, TaskId::new("t1"));
    assert_eq!(state.frameworks.len(), 1);
    assert!(state.frameworks[0].connected);

    // The failover timer fires later against a stale epoch: nothing
    // happens.
    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    cluster.settle().await;
    assert_eq!(cluster.state().await.frameworks.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn framework_failover_timeout_tears_down() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(
        &cluster,
        FrameworkInfo::new("web", "web-role").with_failover_timeout(Duration::from_secs(300)),
    );
    let framework_id = scheduler.expect_subscribed().await;

    offer_one(&cluster, &framework_id, &agent_id, Resources::cpus(2.0));
    let offers = scheduler.expect_offers().await;
    common::accept_launch(
        &cluster,
        &scheduler,
        &framework_id,
        &offers[0],
        TaskInfo::new(TaskId::new("t1"), "t1", agent_id.clone(), Resources::cpus(1.0)),
    );
    assert!(matches!(agent.recv().await, AgentMessage::RunTask { .. }));
    cluster.settle().await;

    cluster.handle.scheduler_disconnected(scheduler.peer.clone());
    cluster.settle().await;
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    cluster.settle().await;

    // The workload was shut down on the agent and the framework is gone.
    assert!(matches!(
        agent.recv().await,
        AgentMessage::ShutdownFramework { .. }
    ));
    let state = cluster.state().await;
    assert!(state.frameworks.is_empty());
    assert_eq!(state.completed_frameworks.len(), 1);
    assert_eq!(state.completed_frameworks[0].id, framework_id);
    assert!(state.tasks.is_empty());

    // Its resources went back to the allocator.
    let recovered = cluster.allocator.recovered();
    assert!(recovered
        .iter()
        .any(|(f, a, r)| f == &framework_id && a == &agent_id && *r == Resources::cpus(1.0)));
    assert_resource_invariants(&state);
}

#[tokio::test(start_paused = true)]
async fn zero_failover_timeout_fires_immediately() {
    // The master default of zero means teardown on the next actor turn.
    let cluster = TestCluster::start();
    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;
    cluster.settle().await;

    cluster.handle.scheduler_disconnected(scheduler.peer.clone());
    cluster.settle().await;

    let state = cluster.state().await;
    assert!(state.frameworks.is_empty());
    assert_eq!(state.completed_frameworks[0].id, framework_id);
}

#[tokio::test(start_paused = true)]
async fn torn_down_framework_cannot_resubscribe() {
    let cluster = TestCluster::start();
    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;

    scheduler.call(
        &cluster,
        SchedulerCall::Teardown {
            framework_id: framework_id.clone(),
        },
    );
    cluster.settle().await;
    assert!(cluster.state().await.frameworks.is_empty());

    let mut replacement = TestScheduler::new("10.9.0.2:36000");
    replacement.resubscribe(
        &cluster,
        FrameworkInfo::new("web", "web-role"),
        framework_id,
    );
    let message = replacement.expect_error().await;
    assert!(message.contains("torn down"));
}

#[tokio::test(start_paused = true)]
async fn role_whitelist_rejects_unknown_roles() {
    let config = MasterConfig::builder()
        .with_role_whitelist(["web-role".to_owned()])
        .build()
        .unwrap();
    let cluster = TestCluster::start_with(config);

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("batch", "smuggled-role"));
    let message = scheduler.expect_error().await;
    assert!(message.contains("not whitelisted"));

    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    scheduler.expect_subscribed().await;
}

#[tokio::test(start_paused = true)]
async fn authentication_gates_framework_calls() {
    use flotilla_master::auth::StaticAuthenticator;
    use flotilla_model::PeerAddr;

    let config = MasterConfig::builder()
        .with_authentication_required(true)
        .build()
        .unwrap();
    let authenticator = StaticAuthenticator::new()
        .with_principal(PeerAddr::new("10.9.0.1:36000"), "ops");
    let cluster = TestCluster::start_with_auth(config, authenticator);

    // A peer the authenticator recognizes subscribes normally.
    let mut known = TestScheduler::new("10.9.0.1:36000");
    known.subscribe(
        &cluster,
        FrameworkInfo::new("web", "web-role").with_principal("ops"),
    );
    known.expect_subscribed().await;

    // An unknown peer proves no identity and its calls are refused.
    let mut stranger = TestScheduler::new("10.9.0.9:36000");
    stranger.subscribe(&cluster, FrameworkInfo::new("rogue", "web-role"));
    let message = stranger.expect_error().await;
    assert!(message.contains("authentication"));
}

#[tokio::test(start_paused = true)]
async fn master_abdicates_when_registry_is_unavailable() {
    let cluster = TestCluster::start();
    cluster.settle().await;

    cluster.registrar.set_unavailable(true);
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    cluster.settle().await;

    // The admission commit failed fatally: the master stopped leading.
    let result = cluster.master_task.await.unwrap();
    assert_eq!(result, Err(MasterError::Abdicated));
}

#[tokio::test(start_paused = true)]
async fn registry_gc_prunes_unreachable_agents_past_count_cap() {
    let config = MasterConfig::builder()
        .with_registry_max_agent_count(0)
        .with_registry_gc_interval(Duration::from_secs(600))
        .build()
        .unwrap();
    let cluster = TestCluster::start_with(config);

    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;
    cluster.settle().await;

    cluster.handle.agent_disconnected(agent.peer.clone());
    cluster.settle().await;
    tokio::time::advance(Duration::from_secs(11 * 60)).await;
    cluster.settle().await;
    assert!(cluster
        .registrar
        .recover()
        .await
        .unwrap()
        .is_unreachable(&agent_id));

    // Over the count cap: the next GC pass prunes the oldest entries.
    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    cluster.settle().await;

    let registry = cluster.registrar.recover().await.unwrap();
    assert!(!registry.is_unreachable(&agent_id));
    assert_eq!(cluster.state().await.unreachable_agents.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn implicit_reconciliation_reports_all_tasks() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;

    offer_one(&cluster, &framework_id, &agent_id, Resources::cpus(2.0));
    let offers = scheduler.expect_offers().await;
    scheduler.call(
        &cluster,
        SchedulerCall::Accept {
            framework_id: framework_id.clone(),
            offer_ids: vec![offers[0].id.clone()],
            operations: vec![Operation::Launch {
                tasks: vec![
                    TaskInfo::new(TaskId::new("t1"), "t1", agent_id.clone(), Resources::cpus(1.0)),
                    TaskInfo::new(TaskId::new("t2"), "t2", agent_id.clone(), Resources::cpus(1.0)),
                ],
            }],
            filters: None,
        },
    );
    cluster.settle().await;

    scheduler.call(
        &cluster,
        SchedulerCall::Reconcile {
            framework_id: framework_id.clone(),
            tasks: Vec::new(),
        },
    );
    let first = scheduler.expect_update().await;
    let second = scheduler.expect_update().await;
    let mut ids = vec![first.task_id.clone(), second.task_id.clone()];
    ids.sort();
    assert_eq!(ids, vec![TaskId::new("t1"), TaskId::new("t2")]);
    assert_eq!(first.state, TaskState::Staging);
}
