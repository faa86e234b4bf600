//! Authoritative in-memory table of known nodes.
//!
//! The registry is owned by the control loop and mutated only from it. Every
//! other component works from [`NodeRegistry::snapshot`], an immutable map that
//! is rebuilt lazily after mutations and shared through an [`Arc`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::computer::effective_state;
use crate::detector::{Observation, ObservationSource};
use crate::error::ControllerError;
use crate::types::{HostInfo, NodeId, ReportedState, StateCode, WantedState};

/// Immutable node map handed out to readers.
pub type NodeMap = BTreeMap<NodeId, Node>;

/// Everything the controller knows about one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node identity.
    pub id: NodeId,
    /// Last RPC address announced by the resolver.
    pub address: Option<String>,
    /// False while the resolver reports the node as disappeared.
    pub address_reachable: bool,
    /// When the resolver reported the node as disappeared.
    pub disappeared_at: Option<Instant>,
    /// Last state accepted by the stability policy.
    pub reported: ReportedState,
    /// True when the accepted state was synthesised from failed probes.
    pub unreachable: bool,
    /// Operator override, if any.
    pub wanted: Option<WantedState>,
    /// Latest host info payload.
    pub host_info: HostInfo,
    /// Time of the last successful probe.
    pub last_probe_success: Option<Instant>,
    /// Time of the last failed probe.
    pub last_probe_failure: Option<Instant>,
    /// Failed probes since the last success.
    pub consecutive_failures: u32,
    /// Generation the node reported about itself in its last health reply.
    pub node_generation: Option<u64>,
}

impl Node {
    fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address: Some(address),
            address_reachable: true,
            disappeared_at: None,
            reported: ReportedState::initial(),
            unreachable: false,
            wanted: None,
            host_info: HostInfo::default(),
            last_probe_success: None,
            last_probe_failure: None,
            consecutive_failures: 0,
            node_generation: None,
        }
    }

    /// State the node has in a computed cluster state.
    #[must_use]
    pub fn effective_state(&self) -> StateCode {
        effective_state(
            self.reported.code,
            self.wanted.as_ref().map(|wanted| wanted.code),
        )
    }

    /// Address to probe and publish to, unless the resolver lost the node.
    #[must_use]
    pub fn rpc_address(&self) -> Option<&str> {
        if self.address_reachable {
            self.address.as_deref()
        } else {
            None
        }
    }

    /// Whether the node can currently be sent cluster states.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        self.rpc_address().is_some() && !self.unreachable
    }
}

/// Result of announcing a node address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Node was not known before.
    Added,
    /// Known node moved to a new address.
    AddressChanged {
        /// Address in use before the change.
        previous: Option<String>,
    },
    /// Node had disappeared and is reachable again.
    Returned,
    /// Same node, same address.
    Unchanged,
}

/// Effective state before and after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveChange {
    /// Effective state before the mutation.
    pub previous: StateCode,
    /// Effective state after the mutation.
    pub current: StateCode,
}

impl EffectiveChange {
    /// True when the effective state moved.
    #[must_use]
    pub fn changed(self) -> bool {
        self.previous != self.current
    }
}

/// Result of recording an observation for a known node.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationOutcome {
    /// Effective state movement caused by the observation.
    pub effective: EffectiveChange,
    /// Whether the reported state object was replaced.
    pub state_replaced: bool,
    /// Whether the host info payload differs from the stored one.
    pub host_info_changed: bool,
}

/// Result of recording a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSuccess {
    /// The node's self-reported generation moved, i.e. it restarted.
    pub restarted: bool,
}

/// Table of every node known to the controller.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: NodeMap,
    snapshot: Option<Arc<NodeMap>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces a node at the given address, adding it when unknown.
    pub fn upsert(&mut self, id: NodeId, address: &str) -> UpsertOutcome {
        self.snapshot = None;
        let Some(node) = self.nodes.get_mut(&id) else {
            self.nodes.insert(id, Node::new(id, address.to_string()));
            return UpsertOutcome::Added;
        };

        let returned = !node.address_reachable;
        let previous = node.address.clone();
        node.address_reachable = true;
        node.disappeared_at = None;
        if previous.as_deref() != Some(address) {
            node.address = Some(address.to_string());
            if !returned {
                return UpsertOutcome::AddressChanged { previous };
            }
        }
        if returned {
            UpsertOutcome::Returned
        } else {
            UpsertOutcome::Unchanged
        }
    }

    /// Marks a node as lost by the resolver while keeping its state.
    ///
    /// Returns `false` when the node is unknown or was already marked.
    pub fn mark_disappeared(&mut self, id: NodeId, now: Instant) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.address_reachable => {
                node.address_reachable = false;
                node.disappeared_at = Some(now);
                self.snapshot = None;
                true
            }
            _ => false,
        }
    }

    /// Nodes that disappeared at or before `deadline`.
    #[must_use]
    pub fn disappeared_before(&self, deadline: Instant) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.disappeared_at.is_some_and(|at| at <= deadline))
            .map(|node| node.id)
            .collect()
    }

    /// Removes a node explicitly.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let removed = self.nodes.remove(&id)?;
        self.snapshot = None;
        if let Some(wanted) = &removed.wanted {
            warn!(
                node = %id,
                wanted = %wanted.code,
                reason = wanted.reason.as_deref().unwrap_or(""),
                "discarding wanted state of removed node"
            );
        }
        Some(removed)
    }

    /// Applies an observation accepted by the stability policy, plus host info.
    ///
    /// Unknown nodes are ignored with a warning: a probe reply can race with
    /// the node's removal.
    pub fn record_observation(
        &mut self,
        id: NodeId,
        observation: Option<&Observation>,
        host_info: Option<HostInfo>,
    ) -> Option<ObservationOutcome> {
        let Some(node) = self.nodes.get_mut(&id) else {
            warn!(node = %id, "dropping observation for unknown node");
            return None;
        };
        self.snapshot = None;

        let previous = node.effective_state();
        let mut state_replaced = false;
        if let Some(observation) = observation {
            let unreachable = observation.source == ObservationSource::Unreachable;
            if node.reported.code != observation.code
                || node.reported.description != observation.description
                || node.unreachable != unreachable
            {
                node.reported = ReportedState {
                    code: observation.code,
                    description: observation.description.clone(),
                    generation: node.reported.generation + 1,
                };
                node.unreachable = unreachable;
                state_replaced = true;
            }
        }

        let mut host_info_changed = false;
        if let Some(info) = host_info
            && info != node.host_info
        {
            node.host_info = info;
            host_info_changed = true;
        }

        Some(ObservationOutcome {
            effective: EffectiveChange {
                previous,
                current: node.effective_state(),
            },
            state_replaced,
            host_info_changed,
        })
    }

    /// Resets failure bookkeeping after a successful probe.
    pub fn record_probe_success(
        &mut self,
        id: NodeId,
        now: Instant,
        node_generation: u64,
    ) -> Option<ProbeSuccess> {
        let node = self.nodes.get_mut(&id)?;
        self.snapshot = None;
        node.consecutive_failures = 0;
        node.last_probe_success = Some(now);
        let restarted = node
            .node_generation
            .is_some_and(|previous| previous != node_generation);
        node.node_generation = Some(node_generation);
        Some(ProbeSuccess { restarted })
    }

    /// Counts a failed probe, returning the consecutive failure count.
    pub fn record_probe_failure(&mut self, id: NodeId, now: Instant) -> Option<u32> {
        let node = self.nodes.get_mut(&id)?;
        self.snapshot = None;
        node.consecutive_failures = node.consecutive_failures.saturating_add(1);
        node.last_probe_failure = Some(now);
        Some(node.consecutive_failures)
    }

    /// Installs an operator override.
    pub fn set_wanted_state(
        &mut self,
        id: NodeId,
        wanted: WantedState,
    ) -> Result<EffectiveChange, ControllerError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(ControllerError::NodeNotFound(id))?;
        if !wanted.code.allowed_as_wanted(id.node_type()) {
            return Err(ControllerError::InvalidWantedState {
                node: id,
                code: wanted.code,
            });
        }
        self.snapshot = None;
        let previous = node.effective_state();
        node.wanted = Some(wanted);
        Ok(EffectiveChange {
            previous,
            current: node.effective_state(),
        })
    }

    /// Removes an operator override.
    pub fn clear_wanted_state(&mut self, id: NodeId) -> Result<EffectiveChange, ControllerError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(ControllerError::NodeNotFound(id))?;
        self.snapshot = None;
        let previous = node.effective_state();
        node.wanted = None;
        Ok(EffectiveChange {
            previous,
            current: node.effective_state(),
        })
    }

    /// Drops wanted states whose expiry passed.
    pub fn expire_wanted_states(&mut self, now: Instant) -> Vec<(NodeId, EffectiveChange)> {
        let mut expired = Vec::new();
        for node in self.nodes.values_mut() {
            if node.wanted.as_ref().is_some_and(|wanted| wanted.is_expired(now)) {
                let previous = node.effective_state();
                node.wanted = None;
                debug!(node = %node.id, "wanted state expired");
                expired.push((
                    node.id,
                    EffectiveChange {
                        previous,
                        current: node.effective_state(),
                    },
                ));
            }
        }
        if !expired.is_empty() {
            self.snapshot = None;
        }
        expired
    }

    /// Borrow a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Whether the node is known.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Iterate over known nodes in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no nodes are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Immutable view of every node, shared until the next mutation.
    pub fn snapshot(&mut self) -> Arc<NodeMap> {
        Arc::clone(
            self.snapshot
                .get_or_insert_with(|| Arc::new(self.nodes.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn up(description: &str) -> Observation {
        Observation::reported(StateCode::Up, description)
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::storage(1);
        assert_eq!(registry.upsert(id, "10.0.0.1:19100"), UpsertOutcome::Added);
        assert_eq!(
            registry.upsert(id, "10.0.0.1:19100"),
            UpsertOutcome::Unchanged
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.upsert(id, "10.0.0.2:19100"),
            UpsertOutcome::AddressChanged {
                previous: Some("10.0.0.1:19100".to_string())
            }
        );
    }

    #[test]
    fn observation_for_unknown_node_is_dropped() {
        let mut registry = NodeRegistry::new();
        let outcome = registry.record_observation(NodeId::storage(9), Some(&up("")), None);
        assert!(outcome.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn identical_observation_does_not_replace_state() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::storage(0);
        registry.upsert(id, "a:1");
        let first = registry.record_observation(id, Some(&up("")), None).unwrap();
        assert!(first.state_replaced);
        assert!(first.effective.changed());
        let generation = registry.get(id).unwrap().reported.generation;

        let second = registry.record_observation(id, Some(&up("")), None).unwrap();
        assert!(!second.state_replaced);
        assert!(!second.effective.changed());
        assert_eq!(registry.get(id).unwrap().reported.generation, generation);
    }

    #[test]
    fn host_info_change_is_reported_separately() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::storage(0);
        registry.upsert(id, "a:1");
        registry.record_observation(id, Some(&up("")), None);
        let info = HostInfo::new(serde_json::json!({ "disk": 0.5 }));
        let outcome = registry
            .record_observation(id, Some(&up("")), Some(info.clone()))
            .unwrap();
        assert!(outcome.host_info_changed);
        assert!(!outcome.state_replaced);
        let again = registry
            .record_observation(id, Some(&up("")), Some(info))
            .unwrap();
        assert!(!again.host_info_changed);
    }

    #[test]
    fn wanted_state_requires_known_node_and_allowed_code() {
        let mut registry = NodeRegistry::new();
        assert!(matches!(
            registry.set_wanted_state(NodeId::storage(3), WantedState::new(StateCode::Down)),
            Err(ControllerError::NodeNotFound(_))
        ));

        let distributor = NodeId::distributor(0);
        registry.upsert(distributor, "d:1");
        assert!(matches!(
            registry.set_wanted_state(distributor, WantedState::new(StateCode::Maintenance)),
            Err(ControllerError::InvalidWantedState { .. })
        ));
        assert!(registry.get(distributor).unwrap().wanted.is_none());
    }

    #[test]
    fn expired_wanted_state_is_cleared() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::storage(0);
        let now = Instant::now();
        registry.upsert(id, "a:1");
        registry.record_observation(id, Some(&up("")), None);
        let change = registry
            .set_wanted_state(
                id,
                WantedState::new(StateCode::Maintenance).expiring_at(now + Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(change.current, StateCode::Maintenance);

        assert!(registry.expire_wanted_states(now).is_empty());
        let expired = registry.expire_wanted_states(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.current, StateCode::Up);
    }

    #[test]
    fn disappeared_node_keeps_state_but_loses_rpc_address() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::storage(0);
        let now = Instant::now();
        registry.upsert(id, "a:1");
        registry.record_observation(id, Some(&up("")), None);
        assert!(registry.mark_disappeared(id, now));
        assert!(!registry.mark_disappeared(id, now));

        let node = registry.get(id).unwrap();
        assert_eq!(node.effective_state(), StateCode::Up);
        assert!(node.rpc_address().is_none());
        assert_eq!(registry.disappeared_before(now), vec![id]);

        assert_eq!(registry.upsert(id, "a:1"), UpsertOutcome::Returned);
        assert!(registry.disappeared_before(now).is_empty());
    }

    #[test]
    fn snapshot_is_shared_until_mutation() {
        let mut registry = NodeRegistry::new();
        registry.upsert(NodeId::storage(0), "a:1");
        let first = registry.snapshot();
        let second = registry.snapshot();
        assert!(Arc::ptr_eq(&first, &second));

        registry.upsert(NodeId::storage(1), "b:1");
        let third = registry.snapshot();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.len(), 1);
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn probe_generation_change_flags_restart() {
        let mut registry = NodeRegistry::new();
        let id = NodeId::distributor(2);
        let now = Instant::now();
        registry.upsert(id, "d:2");
        assert!(!registry.record_probe_success(id, now, 10).unwrap().restarted);
        assert!(!registry.record_probe_success(id, now, 10).unwrap().restarted);
        assert!(registry.record_probe_success(id, now, 11).unwrap().restarted);
        assert_eq!(registry.record_probe_failure(id, now), Some(1));
        assert_eq!(registry.record_probe_failure(id, now), Some(2));
        registry.record_probe_success(id, now, 11);
        assert_eq!(registry.get(id).unwrap().consecutive_failures, 0);
    }
}
