//! Versioned, immutable cluster state descriptions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeType, StateCode};

/// Per-node entry of the baseline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateEntry {
    /// Effective serving state.
    pub code: StateCode,
    /// Reason the node is in this state.
    pub description: String,
}

/// Cluster-wide serving flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAvailability {
    /// Enough nodes are available for the cluster to serve.
    Up,
    /// The policy thresholds are not met.
    Down {
        /// Which threshold failed.
        reason: String,
    },
}

impl ClusterAvailability {
    /// True for [`ClusterAvailability::Up`].
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

/// State of one distribution space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceState {
    /// False when the space as a whole cannot serve.
    pub available: bool,
    /// Why the space is unavailable.
    pub reason: Option<String>,
    /// Per-node states inside the space.
    pub nodes: BTreeMap<NodeId, StateCode>,
}

/// Authoritative description of which nodes may serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    version: u64,
    availability: ClusterAvailability,
    baseline: BTreeMap<NodeId, NodeStateEntry>,
    spaces: BTreeMap<String, SpaceState>,
}

impl ClusterState {
    /// Builds a state. Version `0` marks an unversioned candidate.
    #[must_use]
    pub const fn new(
        version: u64,
        availability: ClusterAvailability,
        baseline: BTreeMap<NodeId, NodeStateEntry>,
        spaces: BTreeMap<String, SpaceState>,
    ) -> Self {
        Self {
            version,
            availability,
            baseline,
            spaces,
        }
    }

    /// State version; `0` for candidates that were never published.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Cluster-wide serving flag.
    #[must_use]
    pub const fn availability(&self) -> &ClusterAvailability {
        &self.availability
    }

    /// Baseline per-node states.
    #[must_use]
    pub const fn baseline(&self) -> &BTreeMap<NodeId, NodeStateEntry> {
        &self.baseline
    }

    /// Per-space overrides.
    #[must_use]
    pub const fn spaces(&self) -> &BTreeMap<String, SpaceState> {
        &self.spaces
    }

    /// Baseline state of a node; nodes absent from the state are down.
    #[must_use]
    pub fn node_state(&self, id: NodeId) -> StateCode {
        self.baseline
            .get(&id)
            .map_or(StateCode::Down, |entry| entry.code)
    }

    /// State of a node inside a space, falling back to the baseline.
    #[must_use]
    pub fn space_node_state(&self, space: &str, id: NodeId) -> StateCode {
        self.spaces
            .get(space)
            .and_then(|state| state.nodes.get(&id).copied())
            .unwrap_or_else(|| self.node_state(id))
    }

    /// Whether two states describe the same cluster, ignoring versions.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.availability == other.availability
            && self.baseline == other.baseline
            && self.spaces == other.spaces
    }

    /// Number of baseline nodes of a type in the given state.
    #[must_use]
    pub fn count(&self, node_type: NodeType, code: StateCode) -> usize {
        self.baseline
            .iter()
            .filter(|(id, entry)| id.node_type() == node_type && entry.code == code)
            .count()
    }

    fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version:{}", self.version)?;
        if let ClusterAvailability::Down { .. } = self.availability {
            f.write_str(" cluster:d")?;
        }
        for (id, entry) in &self.baseline {
            if entry.code != StateCode::Up {
                write!(f, " {id}:{}", entry.code)?;
            }
        }
        Ok(())
    }
}

/// The unit published to nodes: a cluster state plus activation mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateBundle {
    state: ClusterState,
    deferred_activation: bool,
}

impl ClusterStateBundle {
    /// Wraps a state into a bundle.
    #[must_use]
    pub const fn new(state: ClusterState, deferred_activation: bool) -> Self {
        Self {
            state,
            deferred_activation,
        }
    }

    /// Returns a new bundle carrying `version`; the receiver is left untouched.
    #[must_use]
    pub fn versioned(&self, version: u64) -> Self {
        Self {
            state: self.state.with_version(version),
            deferred_activation: self.deferred_activation,
        }
    }

    /// Bundle version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.state.version
    }

    /// Wrapped cluster state.
    #[must_use]
    pub const fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Whether distributors must wait for an explicit activation signal.
    #[must_use]
    pub const fn deferred_activation(&self) -> bool {
        self.deferred_activation
    }

    /// Same content and activation mode, ignoring versions.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.deferred_activation == other.deferred_activation
            && self.state.same_content(&other.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> BTreeMap<NodeId, NodeStateEntry> {
        let mut map = BTreeMap::new();
        map.insert(
            NodeId::storage(0),
            NodeStateEntry {
                code: StateCode::Up,
                description: String::new(),
            },
        );
        map.insert(
            NodeId::storage(1),
            NodeStateEntry {
                code: StateCode::Maintenance,
                description: "disk swap".to_string(),
            },
        );
        map
    }

    #[test]
    fn versioned_copy_leaves_candidate_untouched() {
        let candidate = ClusterStateBundle::new(
            ClusterState::new(0, ClusterAvailability::Up, baseline(), BTreeMap::new()),
            false,
        );
        let published = candidate.versioned(7);
        assert_eq!(candidate.version(), 0);
        assert_eq!(published.version(), 7);
        assert!(published.same_content(&candidate));
        assert_ne!(published, candidate);
    }

    #[test]
    fn missing_nodes_read_as_down() {
        let state = ClusterState::new(3, ClusterAvailability::Up, baseline(), BTreeMap::new());
        assert_eq!(state.node_state(NodeId::storage(1)), StateCode::Maintenance);
        assert_eq!(state.node_state(NodeId::distributor(0)), StateCode::Down);
        assert_eq!(
            state.space_node_state("default", NodeId::storage(0)),
            StateCode::Up
        );
    }

    #[test]
    fn display_lists_only_non_up_nodes() {
        let state = ClusterState::new(5, ClusterAvailability::Up, baseline(), BTreeMap::new());
        assert_eq!(state.to_string(), "version:5 storage.1:maintenance");
    }

    #[test]
    fn node_id_keys_serialize_as_text() {
        let state = ClusterState::new(1, ClusterAvailability::Up, baseline(), BTreeMap::new());
        let json = serde_json::to_value(&state).unwrap_or_default();
        assert!(json["baseline"].get("storage.1").is_some());
    }
}
