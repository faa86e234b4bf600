//! Candidate cluster state computation.

use std::collections::BTreeMap;

use crate::config::{ClusterPolicyConfig, DistributionSpaceConfig};
use crate::registry::{Node, NodeMap};
use crate::state::{ClusterAvailability, ClusterState, ClusterStateBundle, NodeStateEntry, SpaceState};
use crate::types::{NodeId, NodeType, StateCode};

/// Merges a reported state with an optional wanted state.
///
/// The more restrictive code wins: an operator can take a healthy node out of
/// service, but cannot make a down node appear up.
#[must_use]
pub fn effective_state(reported: StateCode, wanted: Option<StateCode>) -> StateCode {
    wanted.map_or(reported, |wanted| reported.most_restrictive(wanted))
}

/// Turns node states and the availability policy into candidate bundles.
#[derive(Debug, Clone)]
pub struct ClusterStateComputer {
    policy: ClusterPolicyConfig,
    deferred_activation: bool,
}

impl ClusterStateComputer {
    /// Creates a computer for the given policy.
    #[must_use]
    pub const fn new(policy: ClusterPolicyConfig, deferred_activation: bool) -> Self {
        Self {
            policy,
            deferred_activation,
        }
    }

    /// Computes an unversioned candidate from a registry snapshot.
    #[must_use]
    pub fn compute(&self, nodes: &NodeMap) -> ClusterStateBundle {
        let baseline: BTreeMap<NodeId, NodeStateEntry> = nodes
            .values()
            .map(|node| (node.id, baseline_entry(node)))
            .collect();
        let availability = self.availability(&baseline);
        let spaces = self
            .policy
            .spaces
            .iter()
            .map(|space| {
                (
                    space.name.clone(),
                    compute_space(space, &baseline, &availability),
                )
            })
            .collect();
        ClusterStateBundle::new(
            ClusterState::new(0, availability, baseline, spaces),
            self.deferred_activation,
        )
    }

    fn availability(&self, baseline: &BTreeMap<NodeId, NodeStateEntry>) -> ClusterAvailability {
        let checks = [
            (
                NodeType::Storage,
                self.policy.min_storage_nodes_up,
                self.policy.max_storage_down_ratio,
            ),
            (
                NodeType::Distributor,
                self.policy.min_distributor_nodes_up,
                self.policy.max_distributor_down_ratio,
            ),
        ];
        for (node_type, min_up, max_down_ratio) in checks {
            let (total, available) = baseline
                .iter()
                .filter(|(id, _)| id.node_type() == node_type)
                .fold((0usize, 0usize), |(total, available), (_, entry)| {
                    (total + 1, available + usize::from(entry.code.is_available()))
                });
            if available < min_up {
                return ClusterAvailability::Down {
                    reason: format!(
                        "too few {node_type} nodes available ({available} of {total}, need {min_up})"
                    ),
                };
            }
            if total > 0 {
                let down = total - available;
                #[allow(clippy::cast_precision_loss)]
                let ratio = down as f64 / total as f64;
                if ratio > max_down_ratio {
                    return ClusterAvailability::Down {
                        reason: format!(
                            "too many {node_type} nodes down ({down} of {total}, max ratio {max_down_ratio})"
                        ),
                    };
                }
            }
        }
        ClusterAvailability::Up
    }
}

fn baseline_entry(node: &Node) -> NodeStateEntry {
    let code = node.effective_state();
    let description = match &node.wanted {
        Some(wanted) if wanted.code == code && code != node.reported.code => wanted
            .reason
            .clone()
            .unwrap_or_else(|| format!("wanted state {code}")),
        _ => node.reported.description.clone(),
    };
    NodeStateEntry { code, description }
}

fn compute_space(
    space: &DistributionSpaceConfig,
    baseline: &BTreeMap<NodeId, NodeStateEntry>,
    availability: &ClusterAvailability,
) -> SpaceState {
    let members: BTreeMap<NodeId, StateCode> = baseline
        .iter()
        .filter(|(id, _)| {
            id.node_type() == NodeType::Storage
                && space
                    .storage_nodes
                    .as_ref()
                    .is_none_or(|indices| indices.contains(&id.index()))
        })
        .map(|(id, entry)| (*id, entry.code))
        .collect();

    let reason = if let ClusterAvailability::Down { reason } = availability {
        Some(format!("cluster is down: {reason}"))
    } else {
        let available = members.values().filter(|code| code.is_available()).count();
        (available < space.min_nodes_up).then(|| {
            format!(
                "space {} has {available} available storage nodes, needs {}",
                space.name, space.min_nodes_up
            )
        })
    };

    match reason {
        Some(reason) => SpaceState {
            available: false,
            reason: Some(reason),
            nodes: members.into_keys().map(|id| (id, StateCode::Down)).collect(),
        },
        None => SpaceState {
            available: true,
            reason: None,
            nodes: members,
        },
    }
}
