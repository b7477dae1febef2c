//! Operator API scenarios: quota, weights, maintenance, operator-driven
//! reservations, and the event stream.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{offer_one, TestAgent, TestCluster, TestScheduler};
use flotilla_master::error::MasterError;
use flotilla_model::resources::{Resource, CPUS, DISK};
use flotilla_model::{
    AgentId, AgentMessage, FrameworkInfo, InverseOfferState, MachineId, MaintenanceSchedule,
    MaintenanceWindow, MasterEvent, OperatorCall, OperatorResponse, Resources, SchedulerCall,
    SchedulerEvent, Unavailability, Volume,
};

fn node_resources() -> Resources {
    Resources::cpus(4.0) + Resources::mem(8192.0)
}

#[tokio::test(start_paused = true)]
async fn health_version_and_flags() {
    let cluster = TestCluster::start();

    assert!(matches!(
        cluster.operator(OperatorCall::GetHealth).await,
        Ok(OperatorResponse::Health { healthy: true })
    ));
    match cluster.operator(OperatorCall::GetVersion).await {
        Ok(OperatorResponse::Version { version }) => assert!(!version.is_empty()),
        other => panic!("expected version, got {other:?}"),
    }
    match cluster.operator(OperatorCall::GetFlags).await {
        Ok(OperatorResponse::Flags { flags }) => {
            assert!(flags.get("agent_reregister_timeout").is_some());
        }
        other => panic!("expected flags, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn quota_and_weights_round_trip() {
    let cluster = TestCluster::start();

    assert!(matches!(
        cluster
            .operator(OperatorCall::SetQuota {
                role: "web-role".to_owned(),
                guarantee: Resources::cpus(8.0),
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));
    match cluster.operator(OperatorCall::GetQuota).await {
        Ok(OperatorResponse::Quota { quotas }) => {
            assert_eq!(quotas.len(), 1);
            assert_eq!(quotas[0].role, "web-role");
            assert_eq!(quotas[0].guarantee, Resources::cpus(8.0));
        }
        other => panic!("expected quota, got {other:?}"),
    }
    assert!(matches!(
        cluster
            .operator(OperatorCall::RemoveQuota {
                role: "web-role".to_owned(),
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));
    assert!(cluster
        .operator(OperatorCall::RemoveQuota {
            role: "web-role".to_owned(),
        })
        .await
        .is_err());

    assert!(matches!(
        cluster
            .operator(OperatorCall::UpdateWeights {
                weights: vec![("web-role".to_owned(), 2.5)],
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));
    assert!(cluster
        .operator(OperatorCall::UpdateWeights {
            weights: vec![("web-role".to_owned(), 0.0)],
        })
        .await
        .is_err());
    match cluster.operator(OperatorCall::GetWeights).await {
        Ok(OperatorResponse::Weights { weights }) => {
            assert_eq!(weights, vec![("web-role".to_owned(), 2.5)]);
        }
        other => panic!("expected weights, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn operator_reserve_rescinds_blocking_offers() {
    let cluster = TestCluster::start();
    let with_disk = node_resources() + Resources::disk(500.0);
    let mut agent = TestAgent::new("a1", "10.0.0.1", with_disk.clone());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;

    // Everything on the agent is promised away.
    offer_one(&cluster, &framework_id, &agent_id, with_disk);
    let offers = scheduler.expect_offers().await;

    let reserved = Resources::from_entries(vec![Resource::scalar(CPUS, 3.0).with_role("ops")]);
    assert!(matches!(
        cluster
            .operator(OperatorCall::ReserveResources {
                agent_id: agent_id.clone(),
                resources: reserved.clone(),
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));

    // The blocking offer was rescinded to make room.
    match scheduler.recv().await {
        SchedulerEvent::Rescind { offer_id } => assert_eq!(offer_id, offers[0].id),
        other => panic!("expected Rescind, got {other:?}"),
    }
    match agent.recv().await {
        AgentMessage::CheckpointResources { checkpointed } => {
            assert_eq!(checkpointed, reserved);
        }
        other => panic!("expected CheckpointResources, got {other:?}"),
    }

    let state = cluster.state().await;
    assert_eq!(state.agents[0].checkpointed, reserved);
    assert_eq!(state.agents[0].total.scalar("cpus"), 4.0);
    common::assert_resource_invariants(&state);

    // And the volume path stacks on top of a disk reservation.
    let reserved_disk =
        Resources::from_entries(vec![Resource::scalar(DISK, 100.0).with_role("ops")]);
    assert!(cluster
        .operator(OperatorCall::ReserveResources {
            agent_id: agent_id.clone(),
            resources: reserved_disk,
        })
        .await
        .is_ok());
    let volumes = Resources::from_entries(vec![Resource::scalar(DISK, 100.0)
        .with_role("ops")
        .with_volume(Volume::new("v1", "/data"))]);
    assert!(cluster
        .operator(OperatorCall::CreateVolumes {
            agent_id: agent_id.clone(),
            volumes: volumes.clone(),
        })
        .await
        .is_ok());
    let state = cluster.state().await;
    assert!(state.agents[0].checkpointed.contains(&volumes));
}

#[tokio::test(start_paused = true)]
async fn operator_reserve_cannot_take_used_resources() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("a1", "10.0.0.1", Resources::cpus(2.0));
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;

    offer_one(&cluster, &framework_id, &agent_id, Resources::cpus(2.0));
    let offers = scheduler.expect_offers().await;
    common::accept_launch(
        &cluster,
        &scheduler,
        &framework_id,
        &offers[0],
        flotilla_model::TaskInfo::new(
            flotilla_model::TaskId::new("t1"),
            "t1",
            agent_id.clone(),
            Resources::cpus(2.0),
        ),
    );
    assert!(matches!(agent.recv().await, AgentMessage::RunTask { .. }));
    cluster.settle().await;

    let reserved = Resources::from_entries(vec![Resource::scalar(CPUS, 1.0).with_role("ops")]);
    let result = cluster
        .operator(OperatorCall::ReserveResources {
            agent_id,
            resources: reserved,
        })
        .await;
    assert!(matches!(result, Err(MasterError::Resource(_))));
}

#[tokio::test(start_paused = true)]
async fn maintenance_drain_and_down_flow() {
    let cluster = TestCluster::start();
    let mut agent = TestAgent::new("node-1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;

    let mut scheduler = TestScheduler::new("10.9.0.1:36000");
    scheduler.subscribe(&cluster, FrameworkInfo::new("web", "web-role"));
    let framework_id = scheduler.expect_subscribed().await;
    cluster.settle().await;

    let machine = MachineId::new("node-1", "10.0.0.1");
    let window = Unavailability::starting_at(Utc::now()).lasting(Duration::from_secs(3600));
    assert!(matches!(
        cluster
            .operator(OperatorCall::UpdateMaintenanceSchedule {
                schedule: MaintenanceSchedule {
                    windows: vec![MaintenanceWindow {
                        machine_ids: vec![machine.clone()],
                        unavailability: window,
                    }],
                },
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));

    // The allocator (driven manually here) asks the framework to vacate.
    let mut inverse_agents = std::collections::HashMap::new();
    inverse_agents.insert(agent_id.clone(), window);
    assert!(cluster
        .allocator
        .inverse_offer(framework_id.clone(), inverse_agents));
    let inverse_offers = match scheduler.recv().await {
        SchedulerEvent::InverseOffers { inverse_offers } => inverse_offers,
        other => panic!("expected InverseOffers, got {other:?}"),
    };
    assert_eq!(inverse_offers.len(), 1);

    scheduler.call(
        &cluster,
        SchedulerCall::AcceptInverseOffers {
            framework_id: framework_id.clone(),
            inverse_offer_ids: vec![inverse_offers[0].id.clone()],
        },
    );
    cluster.settle().await;

    match cluster.operator(OperatorCall::GetMaintenanceStatus).await {
        Ok(OperatorResponse::MaintenanceStatus { statuses }) => {
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].machine, machine);
            assert_eq!(statuses[0].inverse_offer_statuses.len(), 1);
            assert_eq!(
                statuses[0].inverse_offer_statuses[0].state,
                InverseOfferState::Accepted
            );
        }
        other => panic!("expected maintenance status, got {other:?}"),
    }

    // Down: the agent is shut down and removed, and new registrations
    // from the machine are refused.
    assert!(matches!(
        cluster
            .operator(OperatorCall::StartMaintenance {
                machines: vec![machine.clone()],
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));
    assert!(matches!(agent.recv().await, AgentMessage::Shutdown { .. }));
    cluster.settle().await;
    assert!(cluster.state().await.agents.is_empty());

    let mut comeback = TestAgent::new("node-1", "10.0.0.1", node_resources());
    comeback.register(&cluster);
    assert!(matches!(
        comeback.recv().await,
        AgentMessage::RegistrationRefused { .. }
    ));

    // Up again: registrations are welcome.
    assert!(matches!(
        cluster
            .operator(OperatorCall::StopMaintenance {
                machines: vec![machine],
            })
            .await,
        Ok(OperatorResponse::Ack)
    ));
    comeback.register(&cluster);
    comeback.expect_registered().await;
}

#[tokio::test(start_paused = true)]
async fn start_maintenance_requires_a_schedule() {
    let cluster = TestCluster::start();
    let result = cluster
        .operator(OperatorCall::StartMaintenance {
            machines: vec![MachineId::new("surprise", "10.0.0.7")],
        })
        .await;
    assert!(matches!(result, Err(MasterError::InvalidCall(_))));
}

#[tokio::test(start_paused = true)]
async fn mark_agent_gone_unknown_agent() {
    let cluster = TestCluster::start();
    let result = cluster
        .operator(OperatorCall::MarkAgentGone {
            agent_id: AgentId::new("nobody"),
        })
        .await;
    assert!(matches!(result, Err(MasterError::UnknownAgent(_))));
}

#[tokio::test(start_paused = true)]
async fn subscriber_stream_sees_master_events() {
    let cluster = TestCluster::start();

    let reply = cluster
        .handle
        .operator_call(None, OperatorCall::Subscribe)
        .await
        .unwrap();
    assert!(matches!(
        reply.response,
        Ok(OperatorResponse::Subscribed { .. })
    ));
    let mut events = reply.events.expect("event stream attached");

    let mut agent = TestAgent::new("a1", "10.0.0.1", node_resources());
    agent.register(&cluster);
    let agent_id = agent.expect_registered().await;
    cluster.settle().await;

    match events.recv().await.unwrap() {
        MasterEvent::AgentAdded { agent } => assert_eq!(agent.id, Some(agent_id.clone())),
        other => panic!("expected AgentAdded, got {other:?}"),
    }

    // Heartbeats ride the same stream.
    tokio::time::advance(Duration::from_secs(16)).await;
    let mut saw_heartbeat = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MasterEvent::Heartbeat) {
            saw_heartbeat = true;
        }
    }
    assert!(saw_heartbeat);

    // A dropped subscriber is pruned on the next broadcast.
    drop(events);
    cluster.handle.agent_disconnected(agent.peer.clone());
    cluster.settle().await;
}
