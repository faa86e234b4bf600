#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::config::ControllerConfig;
use fleet_core::controller::{ControllerCore, Dispatcher};
use fleet_core::listener::{ClusterStateListener, ListenerFanOut, NodeEvent};
use fleet_core::prober::ProbeRequest;
use fleet_core::publisher::PublishRequest;
use fleet_core::resolver::ResolverEvent;
use fleet_core::rpc::{HealthReply, RpcError};
use fleet_core::state::ClusterStateBundle;
use fleet_core::status::ControllerStatus;
use fleet_core::types::{HostInfo, NodeId, StateCode, WantedState};
use parking_lot::Mutex;

/// Dispatcher that only records what the core asked for.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub probes: Vec<ProbeRequest>,
    pub publishes: Vec<PublishRequest>,
}

impl Dispatcher for RecordingDispatcher {
    fn probe(&mut self, request: ProbeRequest) {
        self.probes.push(request);
    }

    fn publish(&mut self, request: PublishRequest) {
        self.publishes.push(request);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Node(NodeEvent),
    Candidate,
    Published(u64),
    Converged(u64),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn published(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Published(version) => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn converged(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Converged(version) => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn node_events(&self) -> Vec<NodeEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Node(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn candidates(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Recorded::Candidate))
            .count()
    }
}

impl ClusterStateListener for RecordingListener {
    fn handle_node_event(&self, event: &NodeEvent) {
        self.events.lock().push(Recorded::Node(event.clone()));
    }

    fn handle_new_candidate_state(&self, _candidate: &ClusterStateBundle) {
        self.events.lock().push(Recorded::Candidate);
    }

    fn handle_new_published_state(&self, bundle: &Arc<ClusterStateBundle>) {
        self.events.lock().push(Recorded::Published(bundle.version()));
    }

    fn handle_state_converged_in_cluster(&self, bundle: &Arc<ClusterStateBundle>) {
        self.events.lock().push(Recorded::Converged(bundle.version()));
    }
}

pub const TRANSITION_TIME: Duration = Duration::from_secs(5);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.probe.interval = PROBE_INTERVAL;
    config.probe.timeout = Duration::from_millis(500);
    config.probe.failure_threshold = 3;
    config.stability.storage_transition_time = TRANSITION_TIME;
    config.stability.distributor_transition_time = TRANSITION_TIME;
    config.publish.ack_timeout = ACK_TIMEOUT;
    config.resolver.disappear_grace_period = GRACE_PERIOD;
    config.policy.min_distributor_nodes_up = 0;
    config
}

/// Drives a [`ControllerCore`] with a hand-controlled clock.
pub struct Harness {
    pub core: ControllerCore<RecordingDispatcher>,
    pub listener: Arc<RecordingListener>,
    pub now: Instant,
}

impl Harness {
    pub fn new(config: &ControllerConfig) -> Self {
        let listener = Arc::new(RecordingListener::default());
        let mut fan_out = ListenerFanOut::new();
        fan_out.register(listener.clone());
        Self {
            core: ControllerCore::new(config, RecordingDispatcher::default(), fan_out),
            listener,
            now: Instant::now(),
        }
    }

    /// Three storage nodes, all up, version 2 published and converged.
    /// Recorded events and requests are cleared afterwards.
    pub fn three_up_nodes() -> Self {
        let mut harness = Self::new(&test_config());
        for index in 0..3 {
            harness.appear(NodeId::storage(index));
        }
        harness.tick();
        for index in 0..3 {
            harness.reply(NodeId::storage(index), StateCode::Up);
        }
        harness.tick();
        harness.ack_all();
        assert_eq!(harness.current_version(), 2);
        assert_eq!(harness.listener.converged(), vec![2]);
        harness.listener.take();
        harness.core.dispatcher_mut().probes.clear();
        harness
    }

    pub fn address(node: NodeId) -> String {
        format!("127.0.0.1:{}", 19_100 + node.index())
    }

    pub fn appear(&mut self, node: NodeId) {
        self.resolver(ResolverEvent::Appeared {
            node,
            address: Self::address(node),
        });
    }

    pub fn resolver(&mut self, event: ResolverEvent) {
        self.core.apply_resolver_event(&event, self.now);
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn tick(&mut self) {
        self.core.tick(self.now).unwrap();
    }

    pub fn reply(&mut self, node: NodeId, code: StateCode) {
        self.reply_with(node, code, HostInfo::default(), 1);
    }

    pub fn reply_with(&mut self, node: NodeId, code: StateCode, host_info: HostInfo, generation: u64) {
        self.core.probe_completed(
            node,
            Ok(HealthReply {
                code,
                description: String::new(),
                host_info,
                generation,
            }),
            self.now,
        );
    }

    pub fn time_out(&mut self, node: NodeId) {
        self.core.probe_completed(node, Err(RpcError::Timeout), self.now);
    }

    pub fn take_publishes(&mut self) -> Vec<PublishRequest> {
        std::mem::take(&mut self.core.dispatcher_mut().publishes)
    }

    /// Acknowledges every recorded delivery.
    pub fn ack_all(&mut self) {
        for request in self.take_publishes() {
            self.ack(request.node, request.bundle.version());
        }
    }

    pub fn ack(&mut self, node: NodeId, version: u64) {
        self.core.publish_completed(node, version, Ok(()), self.now);
    }

    pub fn set_wanted(&mut self, node: NodeId, code: StateCode) {
        self.core
            .set_wanted_state(node, WantedState::new(code))
            .unwrap();
    }

    pub fn status(&mut self) -> ControllerStatus {
        self.core.status()
    }

    pub fn current(&mut self) -> Arc<ClusterStateBundle> {
        self.status().current.unwrap()
    }

    pub fn current_version(&mut self) -> u64 {
        self.status().current_version()
    }
}
