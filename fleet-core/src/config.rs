//! Controller configuration.
//!
//! Every section has serde defaults, so a partial TOML file is enough.
//! `ControllerConfig::validate` rejects values the control loop cannot run with.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::types::{NodeId, NodeType};

/// Top-level controller configuration shared by the CLI and the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name of the content cluster this controller manages.
    pub cluster_name: String,
    /// Cadence at which the control loop coalesces node changes into a candidate.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Health probing parameters.
    pub probe: ProbeConfig,
    /// Pending-Down damping windows.
    pub stability: StabilityConfig,
    /// Address resolution tuning.
    pub resolver: ResolverConfig,
    /// Cluster-wide availability thresholds and distribution spaces.
    pub policy: ClusterPolicyConfig,
    /// Cluster state publication parameters.
    pub publish: PublishConfig,
    /// Source of node addresses.
    pub directory: DirectoryConfig,
    /// UDP transport used for node RPCs.
    pub transport: TransportConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "content".to_string(),
            tick_interval: Duration::from_millis(100),
            probe: ProbeConfig::default(),
            stability: StabilityConfig::default(),
            resolver: ResolverConfig::default(),
            policy: ClusterPolicyConfig::default(),
            publish: PublishConfig::default(),
            directory: DirectoryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Reject configurations the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.tick_interval.is_zero() {
            return Err(config_error("tick_interval must be greater than zero"));
        }
        if self.probe.interval.is_zero() {
            return Err(config_error("probe.interval must be greater than zero"));
        }
        if self.probe.failure_threshold == 0 {
            return Err(config_error("probe.failure_threshold must be at least 1"));
        }
        for (name, ratio) in [
            ("policy.max_storage_down_ratio", self.policy.max_storage_down_ratio),
            (
                "policy.max_distributor_down_ratio",
                self.policy.max_distributor_down_ratio,
            ),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(config_error(&format!(
                    "{name} must be within [0, 1], got {ratio}"
                )));
            }
        }

        let mut names = HashSet::new();
        for space in &self.policy.spaces {
            if space.name.trim().is_empty() {
                return Err(config_error("distribution space names must not be empty"));
            }
            if !names.insert(space.name.as_str()) {
                return Err(config_error(&format!(
                    "duplicate distribution space '{}'",
                    space.name
                )));
            }
        }

        if let DirectoryConfig::Static { nodes } = &self.directory {
            let mut seen = HashSet::new();
            for node in nodes {
                if !seen.insert(node.id()) {
                    return Err(config_error(&format!(
                        "node {} is listed twice in the static directory",
                        node.id()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn config_error(message: &str) -> ControllerError {
    ControllerError::Configuration(message.to_string())
}

/// Health probing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Interval between probes of the same node.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Timeout before a probe is treated as failed.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive failures before the node is reported unreachable.
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Damping windows applied to transitions into `Down`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Pending-Down window for storage nodes.
    #[serde(with = "humantime_serde")]
    pub storage_transition_time: Duration,
    /// Pending-Down window for distributor nodes.
    #[serde(with = "humantime_serde")]
    pub distributor_transition_time: Duration,
}

impl StabilityConfig {
    /// Window that applies to nodes of the given role.
    #[must_use]
    pub const fn transition_time(&self, node_type: NodeType) -> Duration {
        match node_type {
            NodeType::Storage => self.storage_transition_time,
            NodeType::Distributor => self.distributor_transition_time,
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            storage_transition_time: Duration::from_secs(5),
            distributor_transition_time: Duration::from_secs(5),
        }
    }
}

/// Address resolution tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long a disappeared node keeps its last-known state before removal.
    #[serde(with = "humantime_serde")]
    pub disappear_grace_period: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            disappear_grace_period: Duration::from_secs(10),
        }
    }
}

/// Cluster-wide availability thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPolicyConfig {
    /// Minimum available storage nodes for the cluster to be up.
    pub min_storage_nodes_up: usize,
    /// Minimum available distributors for the cluster to be up.
    pub min_distributor_nodes_up: usize,
    /// Largest tolerated fraction of unavailable storage nodes.
    pub max_storage_down_ratio: f64,
    /// Largest tolerated fraction of unavailable distributors.
    pub max_distributor_down_ratio: f64,
    /// Distribution spaces computed on top of the baseline.
    pub spaces: Vec<DistributionSpaceConfig>,
}

impl Default for ClusterPolicyConfig {
    fn default() -> Self {
        Self {
            min_storage_nodes_up: 1,
            min_distributor_nodes_up: 1,
            max_storage_down_ratio: 1.0,
            max_distributor_down_ratio: 1.0,
            spaces: Vec::new(),
        }
    }
}

/// A named subset of storage nodes with its own availability threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSpaceConfig {
    /// Space name (e.g. a document type or bucket space).
    pub name: String,
    /// Storage node indices in the space; `None` means every storage node.
    #[serde(default)]
    pub storage_nodes: Option<Vec<u16>>,
    /// Minimum available nodes; below it the whole space is marked down.
    #[serde(default = "default_space_min_nodes_up")]
    pub min_nodes_up: usize,
}

const fn default_space_min_nodes_up() -> usize {
    1
}

/// Publication and redelivery knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Timeout for a single publish RPC.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Time an un-acked node waits before the current version is re-sent.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Whether distributors must wait for an explicit activation signal.
    pub deferred_activation: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            deferred_activation: false,
        }
    }
}

/// Supported node directory sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryConfig {
    /// Fixed node list provided via configuration.
    Static {
        /// Nodes announced at startup.
        #[serde(default)]
        nodes: Vec<StaticNodeConfig>,
    },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::Static { nodes: Vec::new() }
    }
}

/// Single entry of a static node directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    /// Node role.
    pub node_type: NodeType,
    /// Index within the role.
    pub index: u16,
    /// `host:port` RPC endpoint.
    pub address: String,
}

impl StaticNodeConfig {
    /// Identifier of the configured node.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        NodeId::new(self.node_type, self.index)
    }
}

/// Network tuning for the UDP node transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address the controller binds for node RPCs.
    pub bind: String,
    /// Largest datagram the transport will send or accept.
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:19050".to_string(),
            max_message_size: 60 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn duplicate_space_names_are_rejected() {
        let mut config = ControllerConfig::default();
        for _ in 0..2 {
            config.policy.spaces.push(DistributionSpaceConfig {
                name: "music".to_string(),
                storage_nodes: None,
                min_nodes_up: 1,
            });
        }
        assert!(matches!(
            config.validate(),
            Err(ControllerError::Configuration(message)) if message.contains("music")
        ));
    }

    #[test]
    fn out_of_range_ratio_is_rejected() {
        let mut config = ControllerConfig::default();
        config.policy.max_storage_down_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_static_nodes_are_rejected() {
        let node = StaticNodeConfig {
            node_type: NodeType::Storage,
            index: 0,
            address: "127.0.0.1:19100".to_string(),
        };
        let config = ControllerConfig {
            directory: DirectoryConfig::Static {
                nodes: vec![node.clone(), node],
            },
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let mut config = ControllerConfig::default();
        config.probe.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
