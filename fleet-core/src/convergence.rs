//! Per-node acknowledgement tracking for published versions.
//!
//! Only the current version is tracked for convergence; publishing a newer
//! version abandons the previous one. Only each node's latest acknowledgement
//! is kept, and records older than the last converged version are discarded.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::rpc::RpcError;
use crate::state::ClusterStateBundle;
use crate::status::ConvergenceSummary;
use crate::types::NodeId;

/// One node's acknowledgement of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    /// Acknowledged version.
    pub version: u64,
    /// When the acknowledgement was processed.
    pub acked_at: Instant,
}

/// What happened to an incoming acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Newly recorded.
    Recorded,
    /// The node already acknowledged this or a newer version.
    Stale,
    /// Refers to a version that was never published.
    UnknownVersion,
}

#[derive(Debug)]
struct TrackedVersion {
    bundle: Arc<ClusterStateBundle>,
    required: BTreeSet<NodeId>,
    converged: bool,
    /// Set once the bundle is known not to fit in a single message.
    undeliverable: bool,
}

/// Records acknowledgements and decides when the cluster has converged.
#[derive(Debug, Default)]
pub struct ConvergenceTracker {
    current: Option<TrackedVersion>,
    records: BTreeMap<NodeId, AckRecord>,
    last_sent: BTreeMap<NodeId, Instant>,
    in_flight: HashSet<NodeId>,
    last_converged: u64,
}

impl ConvergenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly published version.
    pub fn begin(&mut self, bundle: Arc<ClusterStateBundle>, required: BTreeSet<NodeId>, now: Instant) {
        if let Some(previous) = &self.current
            && !previous.converged
        {
            debug!(
                version = previous.bundle.version(),
                unacked = previous.required.len(),
                "abandoning convergence of superseded version"
            );
        }
        for node in &required {
            self.note_sent(*node, now);
        }
        self.current = Some(TrackedVersion {
            bundle,
            required,
            converged: false,
            undeliverable: false,
        });
    }

    /// Stops redelivering the current version; resending it cannot succeed.
    pub fn mark_undeliverable(&mut self, version: u64) {
        if let Some(current) = &mut self.current
            && current.bundle.version() == version
        {
            current.undeliverable = true;
        }
    }

    /// Notes that the current version was just dispatched to `node`.
    pub fn note_sent(&mut self, node: NodeId, now: Instant) {
        self.last_sent.insert(node, now);
        self.in_flight.insert(node);
    }

    /// Highest version `node` has acknowledged.
    #[must_use]
    pub fn acked_version(&self, node: NodeId) -> Option<u64> {
        self.records.get(&node).map(|record| record.version)
    }

    /// Records an acknowledgement idempotently.
    pub fn record_ack(&mut self, node: NodeId, version: u64, now: Instant) -> AckOutcome {
        let current_version = self.current_version();
        // A late ack for an older version says nothing about the current send.
        if version == current_version {
            self.in_flight.remove(&node);
        }
        if version == 0 || version > current_version {
            warn!(node = %node, version, current = current_version, "ack for a version that was never published");
            return AckOutcome::UnknownVersion;
        }
        if version < self.last_converged || self.acked_version(node).is_some_and(|acked| acked >= version) {
            trace!(node = %node, version, "ignoring stale ack");
            return AckOutcome::Stale;
        }
        self.records.insert(
            node,
            AckRecord {
                version,
                acked_at: now,
            },
        );
        AckOutcome::Recorded
    }

    /// Notes a failed delivery. The node stays due for redelivery unless the
    /// failure shows the version can never be delivered.
    pub fn record_delivery_failure(&mut self, node: NodeId, version: u64, failure: &RpcError) {
        if version != self.current_version() {
            trace!(node = %node, version, "delivery of superseded version failed: {failure}");
            return;
        }
        self.in_flight.remove(&node);
        if failure.is_retryable() {
            debug!(node = %node, version, "cluster state delivery failed: {failure}");
        } else {
            error!(node = %node, version, "cluster state cannot be delivered: {failure}");
            self.mark_undeliverable(version);
        }
    }

    /// Drops a removed node from every required set.
    pub fn remove_node(&mut self, node: NodeId) {
        if let Some(current) = &mut self.current
            && current.required.remove(&node)
            && !current.converged
        {
            debug!(node = %node, version = current.bundle.version(), "dropping removed node from required acks");
        }
        self.records.remove(&node);
        self.last_sent.remove(&node);
        self.in_flight.remove(&node);
    }

    /// Forgets what a restarted node acknowledged; it is due for redelivery now.
    pub fn reset_node(&mut self, node: NodeId) {
        self.records.remove(&node);
        self.last_sent.remove(&node);
        self.in_flight.remove(&node);
    }

    /// Whether the current version was found too large to send.
    #[must_use]
    pub fn is_undeliverable(&self) -> bool {
        self.current.as_ref().is_some_and(|current| current.undeliverable)
    }

    /// Whether `node` must acknowledge the current version for it to converge.
    #[must_use]
    pub fn is_required(&self, node: NodeId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.required.contains(&node))
    }

    /// Whether `node` is required for the current version and has not acked it.
    #[must_use]
    pub fn is_lagging(&self, node: NodeId) -> bool {
        self.current.as_ref().is_some_and(|current| {
            current.required.contains(&node)
                && self.acked_version(node) < Some(current.bundle.version())
        })
    }

    /// Fires at most once per version, when every required node has acked it.
    pub fn check_converged(&mut self) -> Option<Arc<ClusterStateBundle>> {
        let current = self.current.as_ref()?;
        if current.converged {
            return None;
        }
        let version = current.bundle.version();
        let complete = current
            .required
            .iter()
            .all(|node| self.acked_version(*node).is_some_and(|acked| acked >= version));
        if !complete {
            return None;
        }

        let bundle = Arc::clone(&current.bundle);
        if let Some(current) = &mut self.current {
            current.converged = true;
        }
        self.last_converged = version;
        self.records.retain(|_, record| record.version >= version);
        info!(version, "cluster state converged");
        Some(bundle)
    }

    /// Lagging nodes whose last delivery is older than `ack_timeout`.
    ///
    /// Only nodes accepted by `deliverable` are returned, and they are marked
    /// as sent at `now`.
    pub fn due_redeliveries(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
        deliverable: impl Fn(NodeId) -> bool,
    ) -> Vec<NodeId> {
        let Some(current) = &self.current else {
            return Vec::new();
        };
        if current.undeliverable {
            return Vec::new();
        }
        let version = current.bundle.version();
        let due: Vec<NodeId> = current
            .required
            .iter()
            .copied()
            .filter(|node| !self.in_flight.contains(node) && deliverable(*node))
            .filter(|node| self.acked_version(*node) < Some(version))
            .filter(|node| {
                self.last_sent
                    .get(node)
                    .is_none_or(|sent| now.saturating_duration_since(*sent) >= ack_timeout)
            })
            .collect();
        for node in &due {
            self.note_sent(*node, now);
        }
        due
    }

    /// Version currently tracked, `0` before the first publication.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |current| current.bundle.version())
    }

    /// Highest converged version.
    #[must_use]
    pub const fn last_converged(&self) -> u64 {
        self.last_converged
    }

    /// Convergence progress of the current version.
    #[must_use]
    pub fn summary(&self) -> ConvergenceSummary {
        let acked_versions = self
            .records
            .keys()
            .filter_map(|node| self.acked_version(*node).map(|version| (*node, version)))
            .collect();
        let Some(current) = &self.current else {
            return ConvergenceSummary {
                acked_versions,
                ..ConvergenceSummary::default()
            };
        };
        let version = current.bundle.version();
        ConvergenceSummary {
            version,
            converged: current.converged,
            undeliverable: current.undeliverable,
            required: current.required.iter().copied().collect(),
            unacked: current
                .required
                .iter()
                .copied()
                .filter(|node| self.acked_version(*node) < Some(version))
                .collect(),
            acked_versions,
        }
    }
}
