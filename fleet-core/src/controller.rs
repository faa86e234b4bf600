//! The single-writer control loop.
//!
//! [`ControllerCore`] owns the registry, the version counter and the ack table.
//! It is deterministic: time is passed in, and network I/O is handed to a
//! [`Dispatcher`] whose outcomes come back as [`ControlMessage`]s.
//! [`FleetController::spawn`] drives a core from a tokio task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::computer::ClusterStateComputer;
use crate::config::ControllerConfig;
use crate::convergence::{AckOutcome, ConvergenceTracker};
use crate::detector::{Decision, Observation, StateChangeDetector};
use crate::error::ControllerError;
use crate::listener::{ClusterStateListener, ControllerEvent, ListenerFanOut, NodeEvent};
use crate::prober::{HealthProber, ProbeRequest};
use crate::publisher::{ClusterStatePublisher, PublishRequest};
use crate::registry::{EffectiveChange, NodeRegistry};
use crate::resolver::{AddressResolverBridge, ResolverEvent, ResolverOutcome};
use crate::rpc::{HealthReply, NodeRpc, RpcError};
use crate::state::ClusterStateBundle;
use crate::status::ControllerStatus;
use crate::transport::check_bundle_size;
use crate::types::{HostInfo, NodeId, WantedState};

const QUEUE_CAPACITY: usize = 1_024;

/// Input of the control loop.
#[derive(Debug)]
pub enum ControlMessage {
    /// Periodic computation tick.
    Tick,
    /// Notification from the name-resolution directory.
    Resolver(ResolverEvent),
    /// A health probe finished.
    ProbeCompleted {
        /// Probed node.
        node: NodeId,
        /// Reply or failure.
        result: Result<HealthReply, RpcError>,
    },
    /// A cluster state delivery finished.
    PublishCompleted {
        /// Receiving node.
        node: NodeId,
        /// Delivered version.
        version: u64,
        /// Acknowledgement or failure.
        result: Result<(), RpcError>,
    },
    /// Operator override.
    SetWantedState {
        /// Target node.
        node: NodeId,
        /// Requested override.
        wanted: WantedState,
        /// Validation result.
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Operator override removal.
    ClearWantedState {
        /// Target node.
        node: NodeId,
        /// Validation result.
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Explicit operator removal of a node.
    RemoveNode {
        /// Target node.
        node: NodeId,
        /// Validation result.
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
}

/// Issues the network I/O requested by the core.
pub trait Dispatcher: Send {
    /// Starts a health probe.
    fn probe(&mut self, request: ProbeRequest);

    /// Starts a cluster state delivery.
    fn publish(&mut self, request: PublishRequest);
}

/// Dispatcher running every RPC as its own task and queueing the outcome.
pub struct RpcDispatcher {
    rpc: Arc<dyn NodeRpc>,
    queue: mpsc::Sender<ControlMessage>,
    probe_timeout: Duration,
    publish_timeout: Duration,
}

impl RpcDispatcher {
    /// Creates a dispatcher feeding `queue`.
    #[must_use]
    pub fn new(
        rpc: Arc<dyn NodeRpc>,
        queue: mpsc::Sender<ControlMessage>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            rpc,
            queue,
            probe_timeout: config.probe.timeout,
            publish_timeout: config.publish.timeout,
        }
    }
}

impl Dispatcher for RpcDispatcher {
    fn probe(&mut self, request: ProbeRequest) {
        let rpc = Arc::clone(&self.rpc);
        let queue = self.queue.clone();
        let timeout = self.probe_timeout;
        tokio::spawn(async move {
            let result = time::timeout(timeout, rpc.get_node_state(request.node, &request.address))
                .await
                .unwrap_or(Err(RpcError::Timeout));
            let _ = queue
                .send(ControlMessage::ProbeCompleted {
                    node: request.node,
                    result,
                })
                .await;
        });
    }

    fn publish(&mut self, request: PublishRequest) {
        let rpc = Arc::clone(&self.rpc);
        let queue = self.queue.clone();
        let timeout = self.publish_timeout;
        tokio::spawn(async move {
            let version = request.bundle.version();
            let result = time::timeout(
                timeout,
                rpc.set_cluster_state(request.node, &request.address, &request.bundle),
            )
            .await
            .unwrap_or(Err(RpcError::Timeout));
            let _ = queue
                .send(ControlMessage::PublishCompleted {
                    node: request.node,
                    version,
                    result,
                })
                .await;
        });
    }
}

/// Deterministic controller state machine.
pub struct ControllerCore<D: Dispatcher> {
    cluster_name: String,
    ack_timeout: Duration,
    max_message_size: usize,
    registry: NodeRegistry,
    resolver: AddressResolverBridge,
    prober: HealthProber,
    detector: StateChangeDetector,
    computer: ClusterStateComputer,
    publisher: ClusterStatePublisher,
    convergence: ConvergenceTracker,
    fan_out: ListenerFanOut,
    dispatcher: D,
    dirty: bool,
}

impl<D: Dispatcher> ControllerCore<D> {
    /// Builds a core from configuration.
    #[must_use]
    pub fn new(config: &ControllerConfig, dispatcher: D, fan_out: ListenerFanOut) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            ack_timeout: config.publish.ack_timeout,
            max_message_size: config.transport.max_message_size,
            registry: NodeRegistry::new(),
            resolver: AddressResolverBridge::new(config.resolver.clone()),
            prober: HealthProber::new(config.probe.clone()),
            detector: StateChangeDetector::new(config.stability.clone()),
            computer: ClusterStateComputer::new(
                config.policy.clone(),
                config.publish.deferred_activation,
            ),
            publisher: ClusterStatePublisher::new(),
            convergence: ConvergenceTracker::new(),
            fan_out,
            dispatcher,
            dirty: false,
        }
    }

    /// Processes one queued message. Only invariant violations are returned.
    pub fn handle(&mut self, message: ControlMessage, now: Instant) -> Result<(), ControllerError> {
        match message {
            ControlMessage::Tick => return self.tick(now),
            ControlMessage::Resolver(event) => self.apply_resolver_event(&event, now),
            ControlMessage::ProbeCompleted { node, result } => {
                self.probe_completed(node, result, now);
            }
            ControlMessage::PublishCompleted {
                node,
                version,
                result,
            } => self.publish_completed(node, version, result, now),
            ControlMessage::SetWantedState {
                node,
                wanted,
                reply,
            } => {
                let _ = reply.send(self.set_wanted_state(node, wanted));
            }
            ControlMessage::ClearWantedState { node, reply } => {
                let _ = reply.send(self.clear_wanted_state(node));
            }
            ControlMessage::RemoveNode { node, reply } => {
                let _ = reply.send(self.remove_node(node));
            }
        }
        Ok(())
    }

    /// Runs one computation tick.
    ///
    /// Releases expired wanted states and pending transitions, reaps nodes
    /// past their grace period, publishes a coalesced candidate when anything
    /// changed, then schedules redeliveries and probes.
    pub fn tick(&mut self, now: Instant) -> Result<(), ControllerError> {
        for (node, change) in self.registry.expire_wanted_states(now) {
            self.effective_change(node, change);
        }
        for (node, observation) in self.detector.expire(now) {
            debug!(node = %node, "pending transition to down elapsed");
            self.apply_observation(node, Some(&observation), None, now);
        }
        for removed in self.resolver.reap(&mut self.registry, now) {
            self.forget_node(removed.id);
        }

        if self.dirty {
            self.dirty = false;
            self.publish_candidate(now)?;
        }
        self.fire_convergence();

        if let Some(bundle) = self.publisher.current().cloned() {
            let due = self.convergence.due_redeliveries(now, self.ack_timeout, |node| {
                self.registry
                    .get(node)
                    .is_some_and(|entry| entry.is_deliverable())
            });
            for node in due {
                self.deliver(node, &bundle);
            }
        }
        let snapshot = self.registry.snapshot();
        for request in self.prober.due_probes(snapshot.values(), now) {
            trace!(node = %request.node, "probing node");
            self.dispatcher.probe(request);
        }
        Ok(())
    }

    /// Applies a directory notification.
    pub fn apply_resolver_event(&mut self, event: &ResolverEvent, now: Instant) {
        let node = event.node();
        match self.resolver.apply(&mut self.registry, event, now) {
            ResolverOutcome::Added { address } => {
                info!(node = %node, address = %address, "node added");
                self.fan_out.node_event(&NodeEvent::NodeAdded { node, address });
                self.dirty = true;
            }
            ResolverOutcome::AddressUpdated { previous, current } => {
                debug!(node = %node, previous = ?previous, current = %current, "node address changed");
                self.prober.reschedule_now(node);
                self.publisher.mark_owed(node);
                self.catch_up(node, now);
            }
            ResolverOutcome::Returned => {
                debug!(node = %node, "node returned to directory");
                self.prober.reschedule_now(node);
                if self.convergence.is_lagging(node) {
                    self.publisher.mark_owed(node);
                }
                self.catch_up(node, now);
            }
            ResolverOutcome::Disappeared | ResolverOutcome::Unchanged => {}
        }
    }

    /// Handles the outcome of a health probe.
    pub fn probe_completed(&mut self, node: NodeId, result: Result<HealthReply, RpcError>, now: Instant) {
        self.prober.complete(node);
        if !self.registry.contains(node) {
            warn!(node = %node, "dropping probe result for unknown node");
            return;
        }
        match result {
            Ok(reply) => {
                if let Some(success) = self.registry.record_probe_success(node, now, reply.generation)
                    && success.restarted
                {
                    info!(node = %node, generation = reply.generation, "node restarted, resending cluster state");
                    self.convergence.reset_node(node);
                    self.publisher.mark_owed(node);
                }
                let observation = HealthProber::observe_reply(&reply);
                self.observe(node, observation, Some(reply.host_info), now);
                self.catch_up(node, now);
            }
            Err(err) => {
                let Some(failures) = self.registry.record_probe_failure(node, now) else {
                    return;
                };
                match self.prober.observe_failure(failures, &err) {
                    Some(observation) => self.observe(node, observation, None, now),
                    None => trace!(node = %node, failures, "probe failed: {err}"),
                }
            }
        }
    }

    /// Handles the outcome of a cluster state delivery.
    pub fn publish_completed(
        &mut self,
        node: NodeId,
        version: u64,
        result: Result<(), RpcError>,
        now: Instant,
    ) {
        if !self.registry.contains(node) {
            warn!(node = %node, version, "dropping delivery result for unknown node");
            return;
        }
        match result {
            Ok(()) => {
                if self.convergence.record_ack(node, version, now) == AckOutcome::Recorded {
                    trace!(node = %node, version, "cluster state acknowledged");
                    self.fire_convergence();
                }
            }
            Err(err) => {
                // Nodes outside the required set are not redelivered on
                // ack timeout; they wait for the next catch-up instead.
                let owed_again = err.is_retryable()
                    && version == self.convergence.current_version()
                    && !self.convergence.is_required(node);
                self.convergence.record_delivery_failure(node, version, &err);
                if owed_again {
                    debug!(node = %node, version, "catch-up delivery failed, node still owed");
                    self.publisher.mark_owed(node);
                }
            }
        }
    }

    /// Installs an operator override. Takes effect in the next candidate.
    pub fn set_wanted_state(&mut self, node: NodeId, wanted: WantedState) -> Result<(), ControllerError> {
        let code = wanted.code;
        let change = self.registry.set_wanted_state(node, wanted)?;
        info!(node = %node, wanted = %code, "wanted state set");
        self.effective_change(node, change);
        Ok(())
    }

    /// Removes an operator override.
    pub fn clear_wanted_state(&mut self, node: NodeId) -> Result<(), ControllerError> {
        let change = self.registry.clear_wanted_state(node)?;
        info!(node = %node, "wanted state cleared");
        self.effective_change(node, change);
        Ok(())
    }

    /// Removes a node on operator request.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), ControllerError> {
        self.registry
            .remove(node)
            .ok_or(ControllerError::NodeNotFound(node))?;
        info!(node = %node, "node removed by operator");
        self.forget_node(node);
        Ok(())
    }

    /// Immutable status view.
    pub fn status(&mut self) -> ControllerStatus {
        ControllerStatus {
            cluster_name: self.cluster_name.clone(),
            current: self.publisher.current().cloned(),
            nodes: self.registry.snapshot(),
            convergence: self.convergence.summary(),
            owed: self.publisher.owed(),
            last_converged_version: self.convergence.last_converged(),
        }
    }

    /// Event sender, for handing out late subscriptions.
    #[must_use]
    pub fn events(&self) -> broadcast::Sender<ControllerEvent> {
        self.fan_out.sender()
    }

    /// Access to the dispatcher, e.g. to inspect recorded requests in tests.
    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    fn observe(&mut self, node: NodeId, observation: Observation, host_info: Option<HostInfo>, now: Instant) {
        let Some(current) = self.registry.get(node).map(|entry| entry.reported.code) else {
            return;
        };
        match self.detector.observe(node, current, observation, now) {
            Decision::Apply(observation) => {
                self.apply_observation(node, Some(&observation), host_info, now);
            }
            Decision::Hold { .. } => self.apply_observation(node, None, host_info, now),
        }
    }

    fn apply_observation(
        &mut self,
        node: NodeId,
        observation: Option<&Observation>,
        host_info: Option<HostInfo>,
        now: Instant,
    ) {
        let Some(outcome) = self.registry.record_observation(node, observation, host_info) else {
            return;
        };
        self.effective_change(node, outcome.effective);
        if outcome.host_info_changed
            && let Some(entry) = self.registry.get(node)
        {
            let host_info = entry.host_info.clone();
            self.fan_out
                .node_event(&NodeEvent::HostInfoUpdated { node, host_info });
        }
        if outcome.state_replaced {
            self.catch_up(node, now);
        }
    }

    fn effective_change(&mut self, node: NodeId, change: EffectiveChange) {
        if !change.changed() {
            return;
        }
        let description = self
            .registry
            .get(node)
            .map(|entry| entry.reported.description.clone())
            .unwrap_or_default();
        debug!(node = %node, from = %change.previous, to = %change.current, "effective state changed");
        self.fan_out.node_event(&NodeEvent::NodeStateChanged {
            node,
            previous: change.previous,
            current: change.current,
            description,
        });
        self.dirty = true;
    }

    fn forget_node(&mut self, node: NodeId) {
        self.prober.forget(node);
        self.detector.forget(node);
        self.publisher.forget(node);
        self.convergence.remove_node(node);
        self.fan_out.node_event(&NodeEvent::NodeRemoved { node });
        self.dirty = true;
        // The removed node may have been the last one holding back convergence.
        self.fire_convergence();
    }

    fn publish_candidate(&mut self, now: Instant) -> Result<(), ControllerError> {
        let snapshot = self.registry.snapshot();
        let candidate = Arc::new(self.computer.compute(&snapshot));
        self.fan_out.candidate(&candidate);
        if self.publisher.is_unchanged(&candidate) {
            trace!("candidate matches current cluster state, not publishing");
            return Ok(());
        }

        let bundle = match self.publisher.accept(&candidate) {
            Ok(bundle) => bundle,
            Err(err) => {
                error!("control loop invariant violated: {err}");
                return Err(err);
            }
        };
        let plan = self.publisher.plan_delivery(&bundle, &snapshot);
        self.convergence
            .begin(Arc::clone(&bundle), plan.required(), now);
        match check_bundle_size(&bundle, self.max_message_size) {
            Ok(_) => {
                for request in plan.requests {
                    self.dispatcher.publish(request);
                }
            }
            Err(ControllerError::MessageTooLarge { size, limit }) => {
                error!(
                    version = bundle.version(),
                    size,
                    limit,
                    nodes = snapshot.len(),
                    "cluster state does not fit in transport.max_message_size, not delivering"
                );
                self.convergence.mark_undeliverable(bundle.version());
            }
            Err(err) => {
                error!(version = bundle.version(), "cannot encode cluster state: {err}");
                self.convergence.mark_undeliverable(bundle.version());
            }
        }
        self.fan_out.published(&bundle);
        Ok(())
    }

    fn fire_convergence(&mut self) {
        if let Some(bundle) = self.convergence.check_converged() {
            self.fan_out.converged(&bundle);
        }
    }

    /// Sends the current bundle to a node that owes it, once it is deliverable.
    fn catch_up(&mut self, node: NodeId, now: Instant) {
        let Some(bundle) = self.publisher.current().cloned() else {
            return;
        };
        let deliverable = !self.convergence.is_undeliverable()
            && self
                .registry
                .get(node)
                .is_some_and(|entry| entry.is_deliverable());
        if deliverable && self.publisher.take_owed(node) {
            self.convergence.note_sent(node, now);
            self.deliver(node, &bundle);
        }
    }

    fn deliver(&mut self, node: NodeId, bundle: &Arc<ClusterStateBundle>) {
        let Some(address) = self
            .registry
            .get(node)
            .and_then(|entry| entry.rpc_address())
            .map(str::to_string)
        else {
            return;
        };
        debug!(node = %node, version = bundle.version(), "delivering cluster state");
        self.dispatcher.publish(PublishRequest {
            node,
            address,
            bundle: Arc::clone(bundle),
        });
    }
}

/// Entry point spawning a controller on the tokio runtime.
pub struct FleetController;

impl FleetController {
    /// Validates the configuration and starts the control loop.
    pub fn spawn(
        config: ControllerConfig,
        rpc: Arc<dyn NodeRpc>,
        listeners: Vec<Arc<dyn ClusterStateListener>>,
    ) -> Result<ControllerHandle, ControllerError> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut fan_out = ListenerFanOut::new();
        for listener in listeners {
            fan_out.register(listener);
        }
        let dispatcher = RpcDispatcher::new(rpc, queue_tx.clone(), &config);
        let mut core = ControllerCore::new(&config, dispatcher, fan_out);
        let events = core.events();
        let (status_tx, status_rx) = watch::channel(Arc::new(core.status()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(cluster = %config.cluster_name, "starting fleet controller");
        let task = tokio::spawn(run_loop(
            core,
            queue_rx,
            status_tx,
            shutdown_rx,
            config.tick_interval,
        ));
        Ok(ControllerHandle {
            queue: queue_tx,
            status: status_rx,
            events,
            shutdown_tx,
            task,
        })
    }
}

async fn run_loop<D: Dispatcher>(
    mut core: ControllerCore<D>,
    mut queue: mpsc::Receiver<ControlMessage>,
    status: watch::Sender<Arc<ControllerStatus>>,
    mut shutdown: watch::Receiver<bool>,
    tick_interval: Duration,
) -> Result<(), ControllerError> {
    let mut ticker = time::interval(tick_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => core.tick(Instant::now()),
            message = queue.recv() => match message {
                Some(message) => core.handle(message, Instant::now()),
                None => break,
            },
        };
        if let Err(err) = result {
            error!("fleet controller terminating: {err}");
            return Err(err);
        }
        status.send_replace(Arc::new(core.status()));
    }
    info!("fleet controller stopped");
    Ok(())
}

/// Handle to a running controller.
pub struct ControllerHandle {
    queue: mpsc::Sender<ControlMessage>,
    status: watch::Receiver<Arc<ControllerStatus>>,
    events: broadcast::Sender<ControllerEvent>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ControllerError>>,
}

impl ControllerHandle {
    /// Installs an operator override.
    pub async fn set_wanted_state(&self, node: NodeId, wanted: WantedState) -> Result<(), ControllerError> {
        self.request(|reply| ControlMessage::SetWantedState {
            node,
            wanted,
            reply,
        })
        .await
    }

    /// Removes an operator override.
    pub async fn clear_wanted_state(&self, node: NodeId) -> Result<(), ControllerError> {
        self.request(|reply| ControlMessage::ClearWantedState { node, reply })
            .await
    }

    /// Removes a node from the registry.
    pub async fn remove_node(&self, node: NodeId) -> Result<(), ControllerError> {
        self.request(|reply| ControlMessage::RemoveNode { node, reply })
            .await
    }

    /// Feeds a directory notification into the control loop.
    pub async fn resolver_event(&self, event: ResolverEvent) -> Result<(), ControllerError> {
        self.queue
            .send(ControlMessage::Resolver(event))
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> Arc<ControllerStatus> {
        Arc::clone(&self.status.borrow())
    }

    /// Watch channel updated after every processed message.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<Arc<ControllerStatus>> {
        self.status.clone()
    }

    /// Subscribe to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Signals the control loop to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the control loop to terminate.
    pub async fn wait(self) -> Result<(), ControllerError> {
        self.task
            .await
            .map_err(|err| ControllerError::TaskFailed(err.to_string()))?
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ControllerError>>) -> ControlMessage,
    ) -> Result<(), ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(build(reply_tx))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        reply_rx.await.map_err(|_| ControllerError::Stopped)?
    }
}
