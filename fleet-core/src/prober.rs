//! Health probe scheduling and outcome classification.
//!
//! The prober decides *which* nodes to probe on a tick and turns RPC outcomes
//! into observations. Issuing the RPCs is left to the controller's dispatcher,
//! and every outcome is funnelled back into the control loop.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::SmallRng};
use tracing::trace;

use crate::config::ProbeConfig;
use crate::detector::Observation;
use crate::registry::Node;
use crate::rpc::{HealthReply, RpcError};
use crate::types::NodeId;

/// A probe that should be issued now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Target node.
    pub node: NodeId,
    /// Address the probe is sent to.
    pub address: String,
}

/// Tracks outstanding probes and per-node probe deadlines.
#[derive(Debug)]
pub struct HealthProber {
    config: ProbeConfig,
    in_flight: HashSet<NodeId>,
    next_due: HashMap<NodeId, Instant>,
    rng: SmallRng,
}

impl HealthProber {
    /// Creates a prober with the given cadence and failure threshold.
    #[must_use]
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            in_flight: HashSet::new(),
            next_due: HashMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Per-call timeout applied by the dispatcher.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Selects the nodes whose probe interval elapsed and marks them in flight.
    ///
    /// Nodes without a resolvable address and nodes whose previous probe is
    /// still outstanding are skipped.
    pub fn due_probes<'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a Node>,
        now: Instant,
    ) -> Vec<ProbeRequest> {
        let mut due = Vec::new();
        for node in nodes {
            let Some(address) = node.rpc_address() else {
                continue;
            };
            if self.in_flight.contains(&node.id) {
                trace!(node = %node.id, "previous probe still outstanding");
                continue;
            }
            if self.next_due.get(&node.id).is_some_and(|due_at| *due_at > now) {
                continue;
            }
            due.push(ProbeRequest {
                node: node.id,
                address: address.to_string(),
            });
        }

        for request in &due {
            self.in_flight.insert(request.node);
            self.next_due.insert(request.node, now + self.config.interval);
        }
        due.shuffle(&mut self.rng);
        due
    }

    /// Marks the probe for `node` as finished. Returns `false` for unexpected replies.
    pub fn complete(&mut self, node: NodeId) -> bool {
        self.in_flight.remove(&node)
    }

    /// Forgets all bookkeeping for a removed node.
    pub fn forget(&mut self, node: NodeId) {
        self.in_flight.remove(&node);
        self.next_due.remove(&node);
    }

    /// Makes the node due on the next tick, e.g. after its address changed.
    pub fn reschedule_now(&mut self, node: NodeId) {
        self.next_due.remove(&node);
    }

    /// Whether a probe to `node` is outstanding.
    #[must_use]
    pub fn is_in_flight(&self, node: NodeId) -> bool {
        self.in_flight.contains(&node)
    }

    /// Observation carried by a successful reply.
    #[must_use]
    pub fn observe_reply(reply: &HealthReply) -> Observation {
        Observation::reported(reply.code, reply.description.clone())
    }

    /// Observation for a failed probe, once the failure threshold is reached.
    #[must_use]
    pub fn observe_failure(&self, consecutive_failures: u32, error: &RpcError) -> Option<Observation> {
        (consecutive_failures >= self.config.failure_threshold)
            .then(|| Observation::unreachable(consecutive_failures, &error.to_string()))
    }
}
