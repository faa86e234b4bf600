use thiserror::Error;

use crate::types::{NodeId, StateCode};

/// Errors surfaced by the fleet controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Administrative request referenced a node the registry does not know.
    #[error("node {0} is not known to the controller")]
    NodeNotFound(NodeId),
    /// Wanted state is not permitted for the node's role.
    #[error("wanted state {code} is not allowed for node {node}")]
    InvalidWantedState {
        /// Target node.
        node: NodeId,
        /// Rejected code.
        code: StateCode,
    },
    /// A version at or below the current one was about to be published.
    #[error("cluster state version regression (attempted {attempted}, current {current})")]
    VersionRegression {
        /// Version that would have been published.
        attempted: u64,
        /// Highest version already published.
        current: u64,
    },
    /// The control loop has terminated and no longer accepts requests.
    #[error("fleet controller is not running")]
    Stopped,
    /// The control loop task panicked or was cancelled.
    #[error("fleet controller task failed: {0}")]
    TaskFailed(String),
    /// Invalid controller configuration.
    #[error("controller configuration error: {0}")]
    Configuration(String),
    /// Underlying network I/O failure.
    #[error("controller transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for RPC payloads.
    #[error("controller serialization error: {0}")]
    Serialization(String),
    /// Payload exceeded the configured datagram budget.
    #[error("controller message too large: {size} bytes, limit is {limit}")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured `transport.max_message_size`.
        limit: usize,
    },
}

impl ControllerError {
    /// True for errors that must terminate the controller instance.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::VersionRegression { .. })
    }
}
