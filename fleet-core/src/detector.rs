//! Stability policy applied to raw node observations.
//!
//! Transitions into `Down` are buffered for a per-role transition window so a
//! short blip does not churn the cluster state. Everything else, including
//! recovery out of `Down`, is applied immediately.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::config::StabilityConfig;
use crate::types::{NodeId, StateCode};

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationSource {
    /// The node answered a health probe.
    Reported,
    /// Synthesised after the probe failure threshold was crossed.
    Unreachable,
}

/// A raw state observation for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Observed state code.
    pub code: StateCode,
    /// Description attached to the state.
    pub description: String,
    /// Origin of the observation.
    pub source: ObservationSource,
}

impl Observation {
    /// Observation taken from a health reply.
    #[must_use]
    pub fn reported(code: StateCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            source: ObservationSource::Reported,
        }
    }

    /// Observation synthesised for a node that stopped answering probes.
    #[must_use]
    pub fn unreachable(failures: u32, last_error: &str) -> Self {
        Self {
            code: StateCode::Down,
            description: format!(
                "node unreachable after {failures} consecutive failed probes: {last_error}"
            ),
            source: ObservationSource::Unreachable,
        }
    }
}

/// What the control loop should do with an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record the observation now.
    Apply(Observation),
    /// The observation is buffered until `deadline`.
    Hold {
        /// Instant at which the pending transition is applied.
        deadline: Instant,
    },
}

#[derive(Debug, Clone)]
struct PendingDown {
    observation: Observation,
    deadline: Instant,
}

/// Per-node pending-Down buffer.
#[derive(Debug)]
pub struct StateChangeDetector {
    config: StabilityConfig,
    pending: HashMap<NodeId, PendingDown>,
}

impl StateChangeDetector {
    /// Creates a detector with the given damping windows.
    #[must_use]
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Classifies an observation against the node's currently accepted code.
    pub fn observe(
        &mut self,
        id: NodeId,
        current: StateCode,
        observation: Observation,
        now: Instant,
    ) -> Decision {
        if observation.code == StateCode::Down && current != StateCode::Down {
            let window = self.config.transition_time(id.node_type());
            if window.is_zero() {
                return Decision::Apply(observation);
            }
            let pending = self
                .pending
                .entry(id)
                .and_modify(|pending| pending.observation = observation.clone())
                .or_insert_with(|| {
                    debug!(node = %id, from = %current, window = ?window, "holding transition to down");
                    PendingDown {
                        observation,
                        deadline: now + window,
                    }
                });
            return Decision::Hold {
                deadline: pending.deadline,
            };
        }

        if self.pending.remove(&id).is_some() {
            debug!(node = %id, observed = %observation.code, "discarding pending transition to down");
        }
        Decision::Apply(observation)
    }

    /// Releases every pending transition whose window has elapsed.
    pub fn expire(&mut self, now: Instant) -> Vec<(NodeId, Observation)> {
        let mut due: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|id| {
                self.pending
                    .remove(&id)
                    .map(|pending| (id, pending.observation))
            })
            .collect()
    }

    /// Drops any pending transition for a removed node.
    pub fn forget(&mut self, id: NodeId) {
        self.pending.remove(&id);
    }

    /// Deadline of the pending transition for `id`, if one is buffered.
    #[must_use]
    pub fn pending_deadline(&self, id: NodeId) -> Option<Instant> {
        self.pending.get(&id).map(|pending| pending.deadline)
    }

    /// Number of buffered transitions.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
