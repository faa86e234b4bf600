//! Value types shared by every controller component.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role a node plays inside the content cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Node that stores documents.
    Storage,
    /// Node that routes and distributes buckets across storage nodes.
    Distributor,
}

impl NodeType {
    /// Lowercase label used in logs and node identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Distributor => "distributor",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned when parsing a [`NodeId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdError {
    /// Input did not follow the `<type>.<index>` layout.
    #[error("node id '{0}' must look like '<storage|distributor>.<index>'")]
    Malformed(String),
    /// Node type prefix is not recognised.
    #[error("unknown node type '{0}'")]
    UnknownType(String),
    /// Index segment is not a valid integer.
    #[error("invalid node index '{0}'")]
    InvalidIndex(String),
}

/// Immutable identity of a node: its type and index within that type.
///
/// Serialised in its `<type>.<index>` text form so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    node_type: NodeType,
    index: u16,
}

impl NodeId {
    /// Creates a node identifier.
    #[must_use]
    pub const fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    /// Shorthand for a storage node identifier.
    #[must_use]
    pub const fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    /// Shorthand for a distributor node identifier.
    #[must_use]
    pub const fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    /// Node role.
    #[must_use]
    pub const fn node_type(self) -> NodeType {
        self.node_type
    }

    /// Index within the node type.
    #[must_use]
    pub const fn index(self) -> u16 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, index) = value
            .split_once('.')
            .ok_or_else(|| NodeIdError::Malformed(value.to_string()))?;
        let node_type = match kind {
            "storage" => NodeType::Storage,
            "distributor" => NodeType::Distributor,
            other => return Err(NodeIdError::UnknownType(other.to_string())),
        };
        let index = index
            .parse::<u16>()
            .map_err(|_| NodeIdError::InvalidIndex(index.to_string()))?;
        Ok(Self::new(node_type, index))
    }
}

/// Serving state of a node.
///
/// Variants are declared from least to most restrictive, so the derived
/// ordering is the restrictiveness ordering used when merging reported and
/// wanted states: `Up < Initializing < Stopping < Retired < Maintenance < Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateCode {
    /// Serving normally.
    Up,
    /// Starting up and loading data.
    Initializing,
    /// Shutting down gracefully.
    Stopping,
    /// Serving, but scheduled to be drained of data.
    Retired,
    /// Temporarily taken out of service without redistributing data.
    Maintenance,
    /// Not serving.
    Down,
}

impl StateCode {
    /// Returns whichever of the two codes is more restrictive.
    #[must_use]
    pub fn most_restrictive(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether a node in this state counts towards the nodes-up thresholds.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Up | Self::Initializing | Self::Retired)
    }

    /// Whether operators may request this code as a wanted state for the given role.
    #[must_use]
    pub const fn allowed_as_wanted(self, node_type: NodeType) -> bool {
        match node_type {
            NodeType::Storage => {
                matches!(self, Self::Up | Self::Down | Self::Maintenance | Self::Retired)
            }
            NodeType::Distributor => matches!(self, Self::Up | Self::Down),
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Initializing => "initializing",
            Self::Stopping => "stopping",
            Self::Retired => "retired",
            Self::Maintenance => "maintenance",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State a node reported about itself, as accepted by the stability policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedState {
    /// Reported serving state.
    pub code: StateCode,
    /// Free-form description (e.g. why the node is down).
    pub description: String,
    /// Per-node counter bumped every time the reported state is replaced.
    pub generation: u64,
}

impl ReportedState {
    /// State assigned to a node that has never answered a health probe.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            code: StateCode::Down,
            description: "node has not reported its state yet".to_string(),
            generation: 0,
        }
    }
}

/// Operator-supplied override of a node's serving state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedState {
    /// Requested code.
    pub code: StateCode,
    /// Optional operator note.
    pub reason: Option<String>,
    /// Instant after which the override is discarded automatically.
    pub expires_at: Option<Instant>,
}

impl WantedState {
    /// Creates a non-expiring override without a reason.
    #[must_use]
    pub const fn new(code: StateCode) -> Self {
        Self {
            code,
            reason: None,
            expires_at: None,
        }
    }

    /// Attaches an operator reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Makes the override expire at the given instant.
    #[must_use]
    pub const fn expiring_at(mut self, deadline: Instant) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// True once the expiry deadline (if any) has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Opaque metrics/status document returned with every health reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostInfo(serde_json::Value);

impl HostInfo {
    /// Wraps an already-parsed JSON document.
    #[must_use]
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Parses a host info document from its JSON text form.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map(Self)
    }

    /// Serialises the document back to JSON text.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    /// Borrow the underlying JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}
