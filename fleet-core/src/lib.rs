//! Cluster state controller for a content cluster.
//!
//! Tracks the health of every storage and distributor node, computes an
//! authoritative versioned cluster state, publishes it to the nodes and tracks
//! acknowledgement until the cluster has converged.
//!
//! All mutable state is owned by one control loop ([`controller`]); every
//! other consumer sees immutable snapshots.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod computer;
pub mod config;
pub mod controller;
pub mod convergence;
pub mod detector;
pub mod error;
pub mod listener;
pub mod prober;
pub mod publisher;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod state;
pub mod status;
pub mod transport;
pub mod types;

pub use config::ControllerConfig;
pub use controller::{ControlMessage, ControllerCore, ControllerHandle, Dispatcher, FleetController};
pub use error::ControllerError;
pub use listener::{ClusterStateListener, ControllerEvent, NodeEvent};
pub use resolver::ResolverEvent;
pub use rpc::{HealthReply, NodeRpc, RpcError};
pub use state::{ClusterAvailability, ClusterState, ClusterStateBundle};
pub use status::{ControllerStatus, ConvergenceSummary};
pub use transport::UdpNodeRpc;
pub use types::{HostInfo, NodeId, NodeType, StateCode, WantedState};
