//! Version assignment and publication planning.
//!
//! This is the only place cluster state versions are minted. The publisher
//! also remembers nodes that were skipped because they could not be reached,
//! so they can be caught up once they return.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::ControllerError;
use crate::registry::NodeMap;
use crate::state::ClusterStateBundle;
use crate::types::NodeId;

/// A single cluster state delivery to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    /// Receiving node.
    pub node: NodeId,
    /// Address the bundle is sent to.
    pub address: String,
    /// Bundle being delivered.
    pub bundle: Arc<ClusterStateBundle>,
}

/// First delivery round of a freshly published version.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPlan {
    /// Deliveries to dispatch now.
    pub requests: Vec<PublishRequest>,
    /// Nodes skipped because they cannot be reached; they owe this version.
    pub skipped: Vec<NodeId>,
}

impl DeliveryPlan {
    /// Nodes that must acknowledge the version for it to converge.
    #[must_use]
    pub fn required(&self) -> BTreeSet<NodeId> {
        self.requests.iter().map(|request| request.node).collect()
    }
}

/// Mints versions and plans fan-out of published bundles.
#[derive(Debug, Default)]
pub struct ClusterStatePublisher {
    last_version: u64,
    current: Option<Arc<ClusterStateBundle>>,
    owed: BTreeSet<NodeId>,
}

impl ClusterStatePublisher {
    /// Creates a publisher that has not published anything yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest version minted so far.
    #[must_use]
    pub const fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Current (highest) published bundle.
    #[must_use]
    pub const fn current(&self) -> Option<&Arc<ClusterStateBundle>> {
        self.current.as_ref()
    }

    /// Whether a candidate describes the same cluster as the current bundle.
    #[must_use]
    pub fn is_unchanged(&self, candidate: &ClusterStateBundle) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.same_content(candidate))
    }

    /// Accepts a candidate, assigning it the next version.
    pub fn accept(
        &mut self,
        candidate: &ClusterStateBundle,
    ) -> Result<Arc<ClusterStateBundle>, ControllerError> {
        let next = self.last_version.saturating_add(1);
        self.install(candidate, next)
    }

    fn install(
        &mut self,
        candidate: &ClusterStateBundle,
        version: u64,
    ) -> Result<Arc<ClusterStateBundle>, ControllerError> {
        if version <= self.last_version {
            error!(
                attempted = version,
                current = self.last_version,
                "refusing to publish a non-increasing cluster state version"
            );
            return Err(ControllerError::VersionRegression {
                attempted: version,
                current: self.last_version,
            });
        }
        let published = Arc::new(candidate.versioned(version));
        self.last_version = version;
        self.current = Some(Arc::clone(&published));
        info!(version, state = %published.state(), "published cluster state");
        Ok(published)
    }

    /// Splits the node set into deliverable targets and owed nodes.
    ///
    /// Owed nodes from earlier versions now owe this version instead.
    pub fn plan_delivery(&mut self, bundle: &Arc<ClusterStateBundle>, nodes: &NodeMap) -> DeliveryPlan {
        let mut plan = DeliveryPlan::default();
        for node in nodes.values() {
            match node.rpc_address() {
                Some(address) if node.is_deliverable() => {
                    self.owed.remove(&node.id);
                    plan.requests.push(PublishRequest {
                        node: node.id,
                        address: address.to_string(),
                        bundle: Arc::clone(bundle),
                    });
                }
                _ => {
                    debug!(node = %node.id, version = bundle.version(), "node unreachable, owing cluster state");
                    self.owed.insert(node.id);
                    plan.skipped.push(node.id);
                }
            }
        }
        plan
    }

    /// Marks a node as owed the current version.
    pub fn mark_owed(&mut self, node: NodeId) {
        self.owed.insert(node);
    }

    /// Clears the owed mark, returning whether it was set.
    pub fn take_owed(&mut self, node: NodeId) -> bool {
        self.owed.remove(&node)
    }

    /// Forgets a removed node.
    pub fn forget(&mut self, node: NodeId) {
        self.owed.remove(&node);
    }

    /// Nodes currently owed the latest version.
    #[must_use]
    pub fn owed(&self) -> Vec<NodeId> {
        self.owed.iter().copied().collect()
    }
}
