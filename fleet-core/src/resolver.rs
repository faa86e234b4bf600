//! Bridge between the external name-resolution directory and the registry.
//!
//! The directory pushes four kinds of notifications. They are applied in
//! delivery order; a node that disappears keeps its last-known state until the
//! grace period elapses or an operator removes it.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DirectoryConfig, ResolverConfig, StaticNodeConfig};
use crate::registry::{Node, NodeRegistry, UpsertOutcome};
use crate::types::NodeId;

/// Notification delivered by the name-resolution directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    /// A node registered itself at `address`.
    Appeared {
        /// Node identity.
        node: NodeId,
        /// RPC address.
        address: String,
    },
    /// The directory lost the node.
    Disappeared {
        /// Node identity.
        node: NodeId,
    },
    /// The node moved to a new RPC address.
    AddressChanged {
        /// Node identity.
        node: NodeId,
        /// New RPC address.
        address: String,
    },
    /// A disappeared node registered again.
    AddressReturned {
        /// Node identity.
        node: NodeId,
        /// RPC address it returned at.
        address: String,
    },
}

impl ResolverEvent {
    /// Node the event refers to.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        match self {
            Self::Appeared { node, .. }
            | Self::Disappeared { node }
            | Self::AddressChanged { node, .. }
            | Self::AddressReturned { node, .. } => *node,
        }
    }
}

/// Registry-level effect of one resolver event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome {
    /// First sighting of the node.
    Added {
        /// Address it was added with.
        address: String,
    },
    /// A known node is now reached at a different address.
    AddressUpdated {
        /// Previous address.
        previous: Option<String>,
        /// Current address.
        current: String,
    },
    /// A disappeared node is reachable again.
    Returned,
    /// The node stopped being reachable; its state is retained.
    Disappeared,
    /// Nothing changed (duplicate notification or unknown node).
    Unchanged,
}

/// Applies resolver notifications to the registry.
#[derive(Debug, Clone)]
pub struct AddressResolverBridge {
    config: ResolverConfig,
}

impl AddressResolverBridge {
    /// Creates a bridge with the given grace period.
    #[must_use]
    pub const fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Applies one notification.
    pub fn apply(
        &self,
        registry: &mut NodeRegistry,
        event: &ResolverEvent,
        now: Instant,
    ) -> ResolverOutcome {
        match event {
            ResolverEvent::Appeared { node, address }
            | ResolverEvent::AddressChanged { node, address }
            | ResolverEvent::AddressReturned { node, address } => {
                upsert(registry, *node, address)
            }
            ResolverEvent::Disappeared { node } => {
                if registry.mark_disappeared(*node, now) {
                    debug!(node = %node, grace = ?self.config.disappear_grace_period, "node disappeared from directory");
                    ResolverOutcome::Disappeared
                } else {
                    if !registry.contains(*node) {
                        warn!(node = %node, "directory reported unknown node as disappeared");
                    }
                    ResolverOutcome::Unchanged
                }
            }
        }
    }

    /// Removes nodes whose grace period has elapsed.
    pub fn reap(&self, registry: &mut NodeRegistry, now: Instant) -> Vec<Node> {
        let Some(deadline) = now.checked_sub(self.config.disappear_grace_period) else {
            return Vec::new();
        };
        registry
            .disappeared_before(deadline)
            .into_iter()
            .filter_map(|id| {
                info!(node = %id, "removing node after directory grace period");
                registry.remove(id)
            })
            .collect()
    }
}

fn upsert(registry: &mut NodeRegistry, node: NodeId, address: &str) -> ResolverOutcome {
    match registry.upsert(node, address) {
        UpsertOutcome::Added => ResolverOutcome::Added {
            address: address.to_string(),
        },
        UpsertOutcome::AddressChanged { previous } => ResolverOutcome::AddressUpdated {
            previous,
            current: address.to_string(),
        },
        UpsertOutcome::Returned => ResolverOutcome::Returned,
        UpsertOutcome::Unchanged => ResolverOutcome::Unchanged,
    }
}

/// Computes the notifications that move `known` to `discovered`.
///
/// Used by polling directories: the caller keeps the previous listing and
/// feeds the difference to the bridge.
#[must_use]
pub fn directory_delta(
    known: &BTreeMap<NodeId, String>,
    discovered: &BTreeMap<NodeId, String>,
) -> Vec<ResolverEvent> {
    let mut events = Vec::new();
    for (node, address) in discovered {
        match known.get(node) {
            None => events.push(ResolverEvent::Appeared {
                node: *node,
                address: address.clone(),
            }),
            Some(previous) if previous != address => events.push(ResolverEvent::AddressChanged {
                node: *node,
                address: address.clone(),
            }),
            Some(_) => {}
        }
    }
    for node in known.keys().filter(|node| !discovered.contains_key(node)) {
        events.push(ResolverEvent::Disappeared { node: *node });
    }
    events
}

/// Errors raised while listing nodes from a directory backend.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Configured address is not a socket address and does not resolve.
    #[error("invalid address '{addr}' for node {node}: {source}")]
    InvalidAddress {
        /// Node the address belongs to.
        node: NodeId,
        /// Address as configured.
        addr: String,
        /// Resolution failure.
        #[source]
        source: std::io::Error,
    },
}

/// Async interface implemented by directory backends.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Returns the current node listing.
    async fn list(&self) -> Result<BTreeMap<NodeId, String>, DirectoryError>;
}

/// Trait-object alias for directory backends.
pub type DynDirectory = Box<dyn NodeDirectory>;

/// Constructs a directory backend from configuration.
pub fn build_directory(config: &DirectoryConfig) -> Result<DynDirectory, DirectoryError> {
    match config {
        DirectoryConfig::Static { nodes } => Ok(Box::new(StaticDirectory::new(nodes)?)),
    }
}

/// Directory backed by a fixed list from configuration.
struct StaticDirectory {
    nodes: BTreeMap<NodeId, String>,
}

impl StaticDirectory {
    fn new(entries: &[StaticNodeConfig]) -> Result<Self, DirectoryError> {
        let mut nodes = BTreeMap::new();
        for entry in entries {
            let addr = if SocketAddr::from_str(&entry.address).is_ok() {
                entry.address.clone()
            } else {
                let mut resolved =
                    entry
                        .address
                        .to_socket_addrs()
                        .map_err(|source| DirectoryError::InvalidAddress {
                            node: entry.id(),
                            addr: entry.address.clone(),
                            source,
                        })?;
                match resolved.next() {
                    Some(sock) => sock.to_string(),
                    None => {
                        return Err(DirectoryError::InvalidAddress {
                            node: entry.id(),
                            addr: entry.address.clone(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                "no addresses resolved",
                            ),
                        });
                    }
                }
            };
            nodes.insert(entry.id(), addr);
        }
        Ok(Self { nodes })
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn list(&self) -> Result<BTreeMap<NodeId, String>, DirectoryError> {
        Ok(self.nodes.clone())
    }
}
