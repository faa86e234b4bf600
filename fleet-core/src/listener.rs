//! Delivery of node and cluster state events to registered consumers.
//!
//! For a given version, hooks fire strictly as candidate, then published, then
//! converged. Synchronous listeners run inside the control loop; async
//! consumers can [`ListenerFanOut::subscribe`] to a broadcast channel instead.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::state::ClusterStateBundle;
use crate::types::{HostInfo, NodeId, StateCode};

/// Node-level change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The directory announced a node the controller did not know.
    NodeAdded {
        /// New node.
        node: NodeId,
        /// Address it was announced at.
        address: String,
    },
    /// The node's effective state changed.
    NodeStateChanged {
        /// Affected node.
        node: NodeId,
        /// Effective state before the change.
        previous: StateCode,
        /// Effective state after the change.
        current: StateCode,
        /// Description of the new reported state.
        description: String,
    },
    /// Host info changed while the state may not have.
    HostInfoUpdated {
        /// Affected node.
        node: NodeId,
        /// New host info.
        host_info: HostInfo,
    },
    /// The node left the registry.
    NodeRemoved {
        /// Removed node.
        node: NodeId,
    },
}

impl NodeEvent {
    /// Node the event refers to.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        match self {
            Self::NodeAdded { node, .. }
            | Self::NodeStateChanged { node, .. }
            | Self::HostInfoUpdated { node, .. }
            | Self::NodeRemoved { node } => *node,
        }
    }
}

/// Callback contract for in-process observers. Every hook defaults to a no-op.
pub trait ClusterStateListener: Send + Sync {
    /// Called for every node event.
    fn handle_node_event(&self, _event: &NodeEvent) {}

    /// Called with every computed candidate, before publication is attempted.
    fn handle_new_candidate_state(&self, _candidate: &ClusterStateBundle) {}

    /// Called once a version was minted and its first delivery round dispatched.
    fn handle_new_published_state(&self, _bundle: &Arc<ClusterStateBundle>) {}

    /// Called once per version when every required node acknowledged it.
    fn handle_state_converged_in_cluster(&self, _bundle: &Arc<ClusterStateBundle>) {}
}

/// Event mirrored onto the broadcast channel.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Node-level change.
    Node(NodeEvent),
    /// Computed candidate (unversioned).
    Candidate(Arc<ClusterStateBundle>),
    /// Published version.
    Published(Arc<ClusterStateBundle>),
    /// Converged version.
    Converged(Arc<ClusterStateBundle>),
}

/// Ordered fan-out to listeners and broadcast subscribers.
pub struct ListenerFanOut {
    listeners: Vec<Arc<dyn ClusterStateListener>>,
    events_tx: broadcast::Sender<ControllerEvent>,
}

impl Default for ListenerFanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerFanOut {
    /// Creates a fan-out without listeners.
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            listeners: Vec::new(),
            events_tx,
        }
    }

    /// Adds a listener; listeners are called in registration order.
    pub fn register(&mut self, listener: Arc<dyn ClusterStateListener>) {
        self.listeners.push(listener);
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events_tx.subscribe()
    }

    /// Sender half, used by handles to create late subscriptions.
    #[must_use]
    pub fn sender(&self) -> broadcast::Sender<ControllerEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn node_event(&self, event: &NodeEvent) {
        for listener in &self.listeners {
            listener.handle_node_event(event);
        }
        self.broadcast(ControllerEvent::Node(event.clone()));
    }

    pub(crate) fn candidate(&self, candidate: &Arc<ClusterStateBundle>) {
        for listener in &self.listeners {
            listener.handle_new_candidate_state(candidate);
        }
        self.broadcast(ControllerEvent::Candidate(Arc::clone(candidate)));
    }

    pub(crate) fn published(&self, bundle: &Arc<ClusterStateBundle>) {
        for listener in &self.listeners {
            listener.handle_new_published_state(bundle);
        }
        self.broadcast(ControllerEvent::Published(Arc::clone(bundle)));
    }

    pub(crate) fn converged(&self, bundle: &Arc<ClusterStateBundle>) {
        for listener in &self.listeners {
            listener.handle_state_converged_in_cluster(bundle);
        }
        self.broadcast(ControllerEvent::Converged(Arc::clone(bundle)));
    }

    fn broadcast(&self, event: ControllerEvent) {
        // No subscribers is not an error.
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::state::{ClusterAvailability, ClusterState};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct PublishedOnly {
        versions: Mutex<Vec<u64>>,
    }

    impl ClusterStateListener for PublishedOnly {
        fn handle_new_published_state(&self, bundle: &Arc<ClusterStateBundle>) {
            self.versions.lock().push(bundle.version());
        }
    }

    fn bundle(version: u64) -> Arc<ClusterStateBundle> {
        Arc::new(ClusterStateBundle::new(
            ClusterState::new(version, ClusterAvailability::Up, BTreeMap::new(), BTreeMap::new()),
            false,
        ))
    }

    #[test]
    fn listeners_implement_only_the_hooks_they_need() {
        let listener = Arc::new(PublishedOnly::default());
        let mut fan_out = ListenerFanOut::new();
        fan_out.register(listener.clone());
        fan_out.candidate(&bundle(0));
        fan_out.published(&bundle(1));
        fan_out.converged(&bundle(1));
        fan_out.node_event(&NodeEvent::NodeRemoved {
            node: NodeId::storage(0),
        });
        assert_eq!(*listener.versions.lock(), vec![1]);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let fan_out = ListenerFanOut::new();
        let mut events = fan_out.subscribe();
        fan_out.candidate(&bundle(0));
        fan_out.published(&bundle(1));
        fan_out.converged(&bundle(1));
        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::Candidate(b) if b.version() == 0));
        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::Published(b) if b.version() == 1));
        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::Converged(b) if b.version() == 1));
    }
}
