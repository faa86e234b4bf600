//! Read-only status snapshots for introspection consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::registry::{Node, NodeMap};
use crate::state::ClusterStateBundle;
use crate::types::NodeId;

/// Acknowledgement progress of the current version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceSummary {
    /// Version being tracked, `0` before the first publication.
    pub version: u64,
    /// Whether every required node acknowledged `version`.
    pub converged: bool,
    /// Whether `version` is too large to send, so it will never converge.
    pub undeliverable: bool,
    /// Nodes required to acknowledge `version`.
    pub required: Vec<NodeId>,
    /// Required nodes that have not acknowledged yet.
    pub unacked: Vec<NodeId>,
    /// Highest acknowledged version per node.
    pub acked_versions: BTreeMap<NodeId, u64>,
}

/// Immutable view of the controller published after every processed message.
#[derive(Debug, Clone, Default)]
pub struct ControllerStatus {
    /// Cluster the controller manages.
    pub cluster_name: String,
    /// Current published bundle.
    pub current: Option<Arc<ClusterStateBundle>>,
    /// Node table snapshot.
    pub nodes: Arc<NodeMap>,
    /// Convergence of the current version.
    pub convergence: ConvergenceSummary,
    /// Nodes skipped at publication that still owe the current version.
    pub owed: Vec<NodeId>,
    /// Highest version that fully converged.
    pub last_converged_version: u64,
}

impl ControllerStatus {
    /// Version of the current bundle, `0` before the first publication.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.current.as_ref().map_or(0, |bundle| bundle.version())
    }

    /// Snapshot of a single node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Required nodes lagging behind the current version.
    #[must_use]
    pub fn lagging_nodes(&self) -> &[NodeId] {
        &self.convergence.unacked
    }
}
