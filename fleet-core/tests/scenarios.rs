#![allow(missing_docs, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{GRACE_PERIOD, Harness, Recorded, TRANSITION_TIME};
use fleet_core::listener::NodeEvent;
use fleet_core::resolver::ResolverEvent;
use fleet_core::types::{NodeId, StateCode};

#[test]
fn single_probe_timeout_below_threshold_changes_nothing() {
    let mut harness = Harness::three_up_nodes();
    let flaky = NodeId::storage(2);

    harness.advance(Duration::from_secs(1));
    harness.tick();
    harness.time_out(flaky);
    harness.advance(Duration::from_secs(1));
    harness.tick();
    harness.reply(flaky, StateCode::Up);
    harness.tick();

    assert!(harness.listener.take().is_empty());
    assert!(harness.take_publishes().is_empty());
    assert_eq!(harness.current_version(), 2);
    assert_eq!(harness.status().node(flaky).unwrap().consecutive_failures, 0);
}

#[test]
fn sustained_timeouts_publish_node_down_after_transition_window() {
    let mut harness = Harness::three_up_nodes();
    let failing = NodeId::storage(2);

    for _ in 0..3 {
        harness.time_out(failing);
    }
    assert!(harness.listener.take().is_empty());

    harness.advance(TRANSITION_TIME - Duration::from_secs(1));
    harness.tick();
    assert!(harness.listener.published().is_empty());

    harness.advance(Duration::from_secs(1));
    harness.tick();
    assert_eq!(harness.listener.published(), vec![3]);
    let current = harness.current();
    assert_eq!(current.version(), 3);
    assert_eq!(current.state().node_state(failing), StateCode::Down);
    assert_eq!(current.state().node_state(NodeId::storage(0)), StateCode::Up);
    assert!(
        harness
            .listener
            .node_events()
            .iter()
            .any(|event| matches!(
                event,
                NodeEvent::NodeStateChanged { node, previous: StateCode::Up, current: StateCode::Down, .. }
                    if *node == failing
            ))
    );

    // The unreachable node is skipped and owed the version instead.
    let targets: Vec<NodeId> = harness
        .take_publishes()
        .into_iter()
        .map(|request| request.node)
        .collect();
    assert_eq!(targets, vec![NodeId::storage(0), NodeId::storage(1)]);
    assert_eq!(harness.status().owed, vec![failing]);

    harness.ack(NodeId::storage(0), 3);
    harness.ack(NodeId::storage(1), 3);
    assert_eq!(harness.listener.converged(), vec![3]);

    // Recovery is applied at once and the owed version is delivered.
    harness.reply(failing, StateCode::Up);
    let caught_up = harness.take_publishes();
    assert_eq!(caught_up.len(), 1);
    assert_eq!(caught_up[0].node, failing);
    assert_eq!(caught_up[0].bundle.version(), 3);
    harness.tick();
    assert_eq!(harness.current().state().node_state(failing), StateCode::Up);
    assert_eq!(harness.current_version(), 4);
}

#[test]
fn wanted_maintenance_applies_in_next_candidate_and_reverts_when_cleared() {
    let mut harness = Harness::three_up_nodes();
    let node = NodeId::storage(1);

    harness.set_wanted(node, StateCode::Maintenance);
    harness.tick();
    let current = harness.current();
    assert_eq!(current.version(), 3);
    assert_eq!(current.state().node_state(node), StateCode::Maintenance);
    assert_eq!(
        current.state().baseline()[&node].description,
        "wanted state maintenance"
    );

    harness.core.clear_wanted_state(node).unwrap();
    harness.tick();
    let current = harness.current();
    assert_eq!(current.version(), 4);
    assert_eq!(current.state().node_state(node), StateCode::Up);
    assert_eq!(harness.listener.published(), vec![3, 4]);
}

#[test]
fn convergence_completes_when_unacked_node_is_removed() {
    let mut harness = Harness::three_up_nodes();
    let lost = NodeId::storage(2);

    harness.set_wanted(NodeId::storage(0), StateCode::Retired);
    harness.tick();
    assert_eq!(harness.take_publishes().len(), 3);
    harness.ack(NodeId::storage(0), 3);
    harness.ack(NodeId::storage(1), 3);
    harness.resolver(ResolverEvent::Disappeared { node: lost });
    harness.tick();
    assert!(harness.listener.converged().is_empty());
    assert_eq!(harness.status().lagging_nodes(), &[lost]);

    harness.listener.take();
    harness.core.remove_node(lost).unwrap();
    harness.tick();

    assert_eq!(
        harness.listener.take(),
        vec![
            Recorded::Node(NodeEvent::NodeRemoved { node: lost }),
            Recorded::Converged(3),
            Recorded::Candidate,
            Recorded::Published(4),
        ]
    );
    assert_eq!(harness.current().state().baseline().len(), 2);
}

#[test]
fn grace_period_removal_also_completes_convergence() {
    let mut harness = Harness::three_up_nodes();
    let lost = NodeId::storage(2);

    harness.set_wanted(NodeId::storage(0), StateCode::Retired);
    harness.tick();
    harness.ack(NodeId::storage(0), 3);
    harness.ack(NodeId::storage(1), 3);
    harness.resolver(ResolverEvent::Disappeared { node: lost });
    harness.listener.take();

    harness.advance(GRACE_PERIOD);
    harness.tick();
    let events = harness.listener.take();
    let converged = events
        .iter()
        .position(|event| *event == Recorded::Converged(3))
        .unwrap();
    let published = events
        .iter()
        .position(|event| *event == Recorded::Published(4))
        .unwrap();
    assert!(converged < published);
    assert!(!harness.status().nodes.contains_key(&lost));
}
