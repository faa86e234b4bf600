//! Listener that narrates controller events through `tracing`.

use std::sync::Arc;

use fleet_core::listener::{ClusterStateListener, NodeEvent};
use fleet_core::state::ClusterStateBundle;
use tracing::{debug, info, warn};

/// Reports controller events through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl ClusterStateListener for LoggingListener {
    fn handle_node_event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::NodeAdded { node, address } => {
                debug!(node = %node, address = %address, "node announced");
            }
            NodeEvent::NodeStateChanged {
                node,
                previous,
                current,
                description,
            } => {
                if current.is_available() {
                    info!(node = %node, from = %previous, to = %current, "node state changed");
                } else {
                    warn!(node = %node, from = %previous, to = %current, description = %description, "node unavailable");
                }
            }
            NodeEvent::HostInfoUpdated { node, .. } => {
                debug!(node = %node, "host info updated");
            }
            NodeEvent::NodeRemoved { node } => {
                info!(node = %node, "node left the cluster");
            }
        }
    }

    fn handle_new_candidate_state(&self, candidate: &ClusterStateBundle) {
        debug!(state = %candidate.state(), "candidate cluster state");
    }

    fn handle_state_converged_in_cluster(&self, bundle: &Arc<ClusterStateBundle>) {
        if !bundle.state().availability().is_up() {
            warn!(version = bundle.version(), "converged on a cluster state marked down");
        }
    }
}
