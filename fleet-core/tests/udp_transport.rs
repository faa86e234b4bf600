#![allow(missing_docs, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::time::Duration;

use fleet_core::config::{ControllerConfig, TransportConfig};
use fleet_core::controller::FleetController;
use fleet_core::listener::ControllerEvent;
use fleet_core::resolver::ResolverEvent;
use fleet_core::rpc::{NodeRpc, RpcError};
use fleet_core::state::{ClusterAvailability, ClusterState, ClusterStateBundle};
use fleet_core::transport::{NodeRpcMessage, UdpNodeRpc};
use fleet_core::types::{NodeId, StateCode};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Healthy,
    Rejecting,
    Silent,
}

/// Minimal node answering controller RPCs. Delivered versions are forwarded
/// to the returned channel.
async fn spawn_fake_node(behaviour: Behaviour) -> (SocketAddr, mpsc::UnboundedReceiver<u64>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (versions_tx, versions_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = NodeRpcMessage::decode(&buf[..len]) else {
                continue;
            };
            let reply = match (behaviour, request) {
                (Behaviour::Silent, _) => continue,
                (Behaviour::Rejecting, other) => NodeRpcMessage::Error {
                    request_id: other.request_id(),
                    message: "node is shutting down".to_string(),
                },
                (Behaviour::Healthy, NodeRpcMessage::GetNodeState { request_id, .. }) => {
                    NodeRpcMessage::NodeState {
                        request_id,
                        code: StateCode::Up,
                        description: "serving".to_string(),
                        host_info: r#"{"load":0.25}"#.to_string(),
                        generation: 7,
                    }
                }
                (Behaviour::Healthy, NodeRpcMessage::SetClusterState { request_id, bundle, .. }) => {
                    let _ = versions_tx.send(bundle.version());
                    NodeRpcMessage::Ack { request_id }
                }
                (Behaviour::Healthy, _) => continue,
            };
            let payload = reply.encode(64 * 1024).unwrap();
            let _ = socket.send_to(&payload, peer).await;
        }
    });
    (addr, versions_rx)
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        bind: "127.0.0.1:0".to_string(),
        max_message_size: 60 * 1024,
    }
}

fn bundle(version: u64) -> ClusterStateBundle {
    ClusterStateBundle::new(
        ClusterState::new(
            version,
            ClusterAvailability::Up,
            Default::default(),
            Default::default(),
        ),
        true,
    )
}

#[tokio::test]
async fn probe_and_publish_round_trip() {
    let (node_addr, mut versions) = spawn_fake_node(Behaviour::Healthy).await;
    let (rpc, handle) = UdpNodeRpc::start(&transport_config()).await.unwrap();
    let address = node_addr.to_string();

    let reply = rpc
        .get_node_state(NodeId::storage(0), &address)
        .await
        .unwrap();
    assert_eq!(reply.code, StateCode::Up);
    assert_eq!(reply.description, "serving");
    assert_eq!(reply.generation, 7);
    assert_eq!(reply.host_info.as_value()["load"], serde_json::json!(0.25));

    rpc.set_cluster_state(NodeId::storage(0), &address, &bundle(9))
        .await
        .unwrap();
    assert_eq!(versions.recv().await, Some(9));
    assert_eq!(rpc.pending_requests(), 0);

    handle.request_shutdown();
    handle.wait().await;
}

#[tokio::test]
async fn error_reply_is_a_rejection() {
    let (node_addr, _versions) = spawn_fake_node(Behaviour::Rejecting).await;
    let (rpc, handle) = UdpNodeRpc::start(&transport_config()).await.unwrap();
    let result = rpc
        .set_cluster_state(NodeId::distributor(0), &node_addr.to_string(), &bundle(1))
        .await;
    assert_eq!(
        result,
        Err(RpcError::Rejected("node is shutting down".to_string()))
    );
    handle.request_shutdown();
    handle.wait().await;
}

#[tokio::test]
async fn abandoned_request_leaves_no_pending_entry() {
    let (node_addr, _versions) = spawn_fake_node(Behaviour::Silent).await;
    let (rpc, handle) = UdpNodeRpc::start(&transport_config()).await.unwrap();
    let node_addr_str = node_addr.to_string();
    let call = rpc.get_node_state(NodeId::storage(1), &node_addr_str);
    assert!(tokio::time::timeout(Duration::from_millis(100), call).await.is_err());
    assert_eq!(rpc.pending_requests(), 0);
    handle.request_shutdown();
    handle.wait().await;
}

#[tokio::test]
async fn controller_converges_against_live_nodes() {
    let mut config = ControllerConfig::default();
    config.tick_interval = Duration::from_millis(20);
    config.probe.interval = Duration::from_millis(50);
    config.probe.timeout = Duration::from_millis(500);
    config.policy.min_distributor_nodes_up = 0;

    let (rpc, transport) = UdpNodeRpc::start(&transport_config()).await.unwrap();
    let controller = FleetController::spawn(config, rpc, Vec::new()).unwrap();
    let mut events = controller.subscribe();

    let mut nodes = Vec::new();
    for index in 0..3 {
        let (addr, versions) = spawn_fake_node(Behaviour::Healthy).await;
        controller
            .resolver_event(ResolverEvent::Appeared {
                node: NodeId::storage(index),
                address: addr.to_string(),
            })
            .await
            .unwrap();
        nodes.push(versions);
    }

    let mut status = controller.status_watch();
    let converged = tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|status| {
            status.last_converged_version > 0
                && status.last_converged_version == status.current_version()
                && status
                    .current
                    .as_ref()
                    .is_some_and(|bundle| bundle.state().count(fleet_core::NodeType::Storage, StateCode::Up) == 3)
        }),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert!(converged.current.as_ref().unwrap().state().availability().is_up());
    assert!(converged.lagging_nodes().is_empty());

    let mut saw_published = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ControllerEvent::Published(_)) {
            saw_published = true;
        }
    }
    assert!(saw_published);
    for versions in &mut nodes {
        assert!(versions.try_recv().is_ok());
    }

    controller
        .set_wanted_state(
            NodeId::storage(0),
            fleet_core::WantedState::new(StateCode::Maintenance),
        )
        .await
        .unwrap();
    let err = controller
        .set_wanted_state(NodeId::storage(9), fleet_core::WantedState::new(StateCode::Down))
        .await
        .unwrap_err();
    assert!(matches!(err, fleet_core::ControllerError::NodeNotFound(_)));

    controller.request_shutdown();
    controller.wait().await.unwrap();
    transport.request_shutdown();
    transport.wait().await;
}
