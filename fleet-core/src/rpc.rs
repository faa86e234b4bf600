//! Boundary to the request/response transport used to reach nodes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ClusterStateBundle;
use crate::types::{HostInfo, NodeId, StateCode};

/// Failure of a single node RPC. Always treated as data, never as control flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No reply arrived within the configured timeout.
    #[error("rpc timed out")]
    Timeout,
    /// The request could not be delivered or the reply could not be read.
    #[error("rpc transport failure: {0}")]
    Transport(String),
    /// The node answered with an explicit error.
    #[error("rpc rejected by node: {0}")]
    Rejected(String),
    /// The request does not fit in one message. Retrying cannot succeed.
    #[error("rpc payload of {size} bytes exceeds the {limit} byte message limit")]
    TooLarge {
        /// Encoded request size.
        size: usize,
        /// Transport message limit.
        limit: usize,
    },
}

impl RpcError {
    /// Whether sending the same request again can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::TooLarge { .. })
    }
}

/// Reply to a health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReply {
    /// Self-reported serving state.
    pub code: StateCode,
    /// Description attached to the state.
    pub description: String,
    /// Opaque metrics/status payload.
    pub host_info: HostInfo,
    /// Node-chosen generation; it changes when the node process restarts.
    pub generation: u64,
}

/// Transport used by the prober and the publisher.
///
/// Implementations do not need to enforce timeouts; the controller wraps every
/// call in the configured probe or publish timeout.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Asks a node for its current state.
    async fn get_node_state(&self, node: NodeId, address: &str) -> Result<HealthReply, RpcError>;

    /// Pushes a cluster state bundle; `Ok` is the node's acknowledgement.
    async fn set_cluster_state(
        &self,
        node: NodeId,
        address: &str,
        bundle: &ClusterStateBundle,
    ) -> Result<(), RpcError>;
}
