//! UDP implementation of [`NodeRpc`].
//!
//! Every request carries a controller-chosen id that the node echoes back, so
//! replies can be matched to their callers regardless of arrival order.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bincode::{deserialize, serialize};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::config::TransportConfig;
use crate::error::ControllerError;
use crate::rpc::{HealthReply, NodeRpc, RpcError};
use crate::state::ClusterStateBundle;
use crate::types::{HostInfo, NodeId, StateCode};

/// Upper bound on what a `SetClusterState` frame adds around its bundle.
pub const SET_CLUSTER_STATE_HEADROOM: usize = 64;

/// Framed size of `bundle`, or `MessageTooLarge` when it cannot fit in one
/// datagram of `limit` bytes.
pub fn check_bundle_size(bundle: &ClusterStateBundle, limit: usize) -> Result<usize, ControllerError> {
    let size = bincode::serialized_size(bundle)
        .map_err(|err| ControllerError::Serialization(err.to_string()))?;
    let framed = usize::try_from(size)
        .unwrap_or(usize::MAX)
        .saturating_add(SET_CLUSTER_STATE_HEADROOM);
    if framed > limit {
        return Err(ControllerError::MessageTooLarge {
            size: framed,
            limit,
        });
    }
    Ok(framed)
}

/// Datagram exchanged between the controller and nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRpcMessage {
    /// Health probe.
    GetNodeState {
        /// Correlation id.
        request_id: u64,
        /// Node the probe is addressed to.
        node: NodeId,
    },
    /// Health reply. Host info travels as JSON text.
    NodeState {
        /// Correlation id.
        request_id: u64,
        /// Self-reported state.
        code: StateCode,
        /// Description of the state.
        description: String,
        /// Host info document.
        host_info: String,
        /// Process generation of the node.
        generation: u64,
    },
    /// Cluster state push.
    SetClusterState {
        /// Correlation id.
        request_id: u64,
        /// Node the state is addressed to.
        node: NodeId,
        /// Published bundle.
        bundle: ClusterStateBundle,
    },
    /// Acknowledgement of a cluster state push.
    Ack {
        /// Correlation id.
        request_id: u64,
    },
    /// Explicit failure reply.
    Error {
        /// Correlation id.
        request_id: u64,
        /// Node-supplied message.
        message: String,
    },
}

impl NodeRpcMessage {
    /// Correlation id carried by the message.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        match self {
            Self::GetNodeState { request_id, .. }
            | Self::NodeState { request_id, .. }
            | Self::SetClusterState { request_id, .. }
            | Self::Ack { request_id }
            | Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Encodes the message, rejecting payloads above `max_size`.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>, ControllerError> {
        let payload = serialize(self).map_err(|err| ControllerError::Serialization(err.to_string()))?;
        if payload.len() > max_size {
            return Err(ControllerError::MessageTooLarge {
                size: payload.len(),
                limit: max_size,
            });
        }
        Ok(payload)
    }

    /// Decodes a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, ControllerError> {
        deserialize(bytes).map_err(|err| ControllerError::Serialization(err.to_string()))
    }
}

/// Node RPC client over a single UDP socket.
pub struct UdpNodeRpc {
    socket: Arc<UdpSocket>,
    max_message_size: usize,
    next_request_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<NodeRpcMessage>>,
}

impl UdpNodeRpc {
    /// Binds the socket and starts the reply receiver.
    pub async fn start(config: &TransportConfig) -> Result<(Arc<Self>, TransportHandle), ControllerError> {
        let bind = SocketAddr::from_str(&config.bind).map_err(|err| {
            ControllerError::Configuration(format!("invalid transport.bind '{}': {err}", config.bind))
        })?;
        let socket = UdpSocket::bind(bind).await?;
        let rpc = Arc::new(Self {
            socket: Arc::new(socket),
            max_message_size: config.max_message_size,
            next_request_id: AtomicU64::new(1),
            pending: DashMap::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::recv_loop(Arc::clone(&rpc), shutdown_rx));
        Ok((rpc, TransportHandle { shutdown_tx, task }))
    }

    /// Returns the socket address assigned to the underlying UDP socket.
    pub fn local_addr(&self) -> Result<SocketAddr, ControllerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.recv() => {
                    match received {
                        Ok((message, addr)) => self.complete(message, addr),
                        Err(err) => warn!("node rpc recv error: {err}"),
                    }
                }
            }
        }
    }

    async fn recv(&self) -> Result<(NodeRpcMessage, SocketAddr), ControllerError> {
        let mut buf = vec![0u8; self.max_message_size];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        Ok((NodeRpcMessage::decode(&buf[..len])?, addr))
    }

    fn complete(&self, message: NodeRpcMessage, addr: SocketAddr) {
        let request_id = message.request_id();
        if let Some((_, sender)) = self.pending.remove(&request_id) {
            let _ = sender.send(message);
        } else {
            trace!(peer = %addr, request_id, "reply for unknown or abandoned request");
        }
    }

    async fn call(
        &self,
        address: &str,
        build: impl FnOnce(u64) -> NodeRpcMessage,
    ) -> Result<NodeRpcMessage, RpcError> {
        let target = resolve(address).await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let payload = build(request_id)
            .encode(self.max_message_size)
            .map_err(|err| match err {
                ControllerError::MessageTooLarge { size, limit } => {
                    error!(target = %target, size, limit, "request exceeds transport.max_message_size");
                    RpcError::TooLarge { size, limit }
                }
                other => RpcError::Transport(other.to_string()),
            })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };
        self.socket
            .send_to(&payload, target)
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        rx.await
            .map_err(|_| RpcError::Transport("reply channel closed".to_string()))
    }
}

/// Removes the pending entry when the caller gives up, e.g. on timeout.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<NodeRpcMessage>>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, RpcError> {
    if let Ok(addr) = SocketAddr::from_str(address) {
        return Ok(addr);
    }
    lookup_host(address)
        .await
        .map_err(|err| RpcError::Transport(format!("failed to resolve '{address}': {err}")))?
        .next()
        .ok_or_else(|| RpcError::Transport(format!("no addresses for '{address}'")))
}

fn unexpected(reply: &NodeRpcMessage) -> RpcError {
    match reply {
        NodeRpcMessage::Error { message, .. } => RpcError::Rejected(message.clone()),
        other => RpcError::Transport(format!("unexpected reply {other:?}")),
    }
}

#[async_trait]
impl NodeRpc for UdpNodeRpc {
    async fn get_node_state(&self, node: NodeId, address: &str) -> Result<HealthReply, RpcError> {
        let reply = self
            .call(address, |request_id| NodeRpcMessage::GetNodeState { request_id, node })
            .await?;
        match reply {
            NodeRpcMessage::NodeState {
                code,
                description,
                host_info,
                generation,
                ..
            } => {
                let host_info = HostInfo::from_json_str(&host_info)
                    .map_err(|err| RpcError::Transport(format!("invalid host info: {err}")))?;
                Ok(HealthReply {
                    code,
                    description,
                    host_info,
                    generation,
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn set_cluster_state(
        &self,
        node: NodeId,
        address: &str,
        bundle: &ClusterStateBundle,
    ) -> Result<(), RpcError> {
        let reply = self
            .call(address, |request_id| NodeRpcMessage::SetClusterState {
                request_id,
                node,
                bundle: bundle.clone(),
            })
            .await?;
        match reply {
            NodeRpcMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

/// Handle used to stop the transport's receive task.
pub struct TransportHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Signals the receive loop to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the receive loop to terminate.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}
