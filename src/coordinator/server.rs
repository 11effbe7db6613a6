//! Parameter server node
//!
//! One [`ParameterServer`] runs per process. It owns the node's mesh view
//! and its transport, and provides:
//! - Join/launch/shutdown lifecycle
//! - Update fan-out through the tree
//! - Parameter requests and responses
//! - Mesh mutation and drop recovery when running as the root
//!
//! All inbound traffic is handled by a single event loop task, so mesh
//! application, subscriber notification and forwarding never interleave.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dedup::SeenUpdates;
use super::requests::{PendingRequests, RequestConsumers};
use super::subscribers::{SubscriberId, Subscriptions};
use crate::error::{Error, Result};
use crate::mesh::{Mesh, MeshBuildMode, TopologyBuilder, DEFAULT_FANOUT_LIMIT};
use crate::protocol::{
    DetachedNotice, JoinAck, JoinRejected, JoinRequest, Message, MessageEnvelope, MeshUpdate,
    ParamsKind, ParamsRequest, ParamsResponse, Payload, UpdateMessage, PROTOCOL_VERSION,
};
use crate::recovery::{DropReport, RecoveryManager};
use crate::transport::{Delivery, Transport, TransportEvent};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Runtime settings for a parameter server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Placement policy (used by the root)
    pub build_mode: MeshBuildMode,

    /// Maximum downstreams per node in MESH mode
    pub fanout_limit: usize,

    /// Rejoin automatically after a drop notice
    pub auto_rejoin: bool,

    /// Request model and updater parameters after a restart
    pub sync_on_restart: bool,

    /// Update ids remembered for duplicate suppression
    pub dedup_capacity: usize,

    /// How long a parameter request waits for its response
    pub request_timeout: Duration,

    /// How long `launch` waits for the join acknowledgment
    pub join_timeout: Duration,

    /// Node answering parameter requests; the mesh root when unset
    pub parameter_source: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            build_mode: MeshBuildMode::default(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            auto_rejoin: true,
            sync_on_restart: true,
            dedup_capacity: 4096,
            request_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(30),
            parameter_source: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Node State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Constructed, not launched
    #[default]
    Created,
    /// Join request sent, waiting for acknowledgment
    Joining,
    /// Member of the mesh
    Active,
    /// Removed from the mesh by the root
    Detached,
    /// Shut down; terminal
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "CREATED",
            NodeState::Joining => "JOINING",
            NodeState::Active => "ACTIVE",
            NodeState::Detached => "DETACHED",
            NodeState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", s)
    }
}

// ─────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────

/// Snapshot of a node's traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub updates_sent: u64,
    pub updates_received: u64,
    pub updates_forwarded: u64,
    pub requests_served: u64,
    pub responses_received: u64,
    pub dropped_messages: u64,
}

#[derive(Default)]
struct Counters {
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
    updates_forwarded: AtomicU64,
    requests_served: AtomicU64,
    responses_received: AtomicU64,
    dropped_messages: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> NodeStats {
        NodeStats {
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            updates_received: self.updates_received.load(Ordering::Relaxed),
            updates_forwarded: self.updates_forwarded.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared Node Internals
// ─────────────────────────────────────────────────────────────────

struct Inner {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    id: String,
    is_root: bool,

    state: RwLock<NodeState>,
    mesh: RwLock<Arc<Mesh>>,
    recovery: Mutex<RecoveryManager>,

    subscriptions: Subscriptions,
    pending: PendingRequests,
    consumers: RequestConsumers,
    seen: Mutex<SeenUpdates>,
    counters: Counters,

    join_waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

// ─────────────────────────────────────────────────────────────────
// Parameter Server
// ─────────────────────────────────────────────────────────────────

/// Handle on one mesh node; clones share the same node
#[derive(Clone)]
pub struct ParameterServer {
    inner: Arc<Inner>,
}

impl ParameterServer {
    /// Create a node on top of a transport
    ///
    /// The node is the root when its transport names itself as upstream.
    /// Fails only on invalid configuration.
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let builder = TopologyBuilder::new(config.build_mode, config.fanout_limit)?;
        if config.request_timeout.is_zero() || config.join_timeout.is_zero() {
            return Err(Error::config_field_invalid(
                "requests",
                "timeouts must be greater than zero",
            ));
        }

        let id = transport.id().to_string();
        let is_root = transport.is_root();
        // Placeholder view until the join acknowledgment brings the real one
        let mesh = if is_root {
            Mesh::new(id.clone())
        } else {
            Mesh::new(transport.upstream_id())
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                seen: Mutex::new(SeenUpdates::new(config.dedup_capacity)),
                config,
                transport,
                id,
                is_root,
                state: RwLock::new(NodeState::Created),
                mesh: RwLock::new(Arc::new(mesh)),
                recovery: Mutex::new(RecoveryManager::new(builder)),
                subscriptions: Subscriptions::new(),
                pending: PendingRequests::new(),
                consumers: RequestConsumers::new(),
                counters: Counters::default(),
                join_waiter: Mutex::new(None),
                shutdown_tx,
                event_loop: Mutex::new(None),
            }),
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start the node
    ///
    /// The root becomes active immediately. Any other node sends a join
    /// request to its upstream-of-record and returns once the root has
    /// acknowledged it.
    pub async fn launch(&self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Created {
            return Err(Error::invalid_state("launch", state));
        }

        self.start_event_loop().await?;

        if self.inner.is_root {
            self.inner.set_state(NodeState::Active);
            info!(node = %self.inner.id, "Root launched");
            return Ok(());
        }

        self.join().await
    }

    async fn start_event_loop(&self) -> Result<()> {
        if self.inner.event_loop.lock().is_some() {
            return Ok(());
        }

        let inbox = self.inner.transport.connect().await?;
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_event_loop(inner, inbox, shutdown_rx));
        *self.inner.event_loop.lock() = Some(handle);
        Ok(())
    }

    async fn join(&self) -> Result<()> {
        let inner = &self.inner;
        let target = inner.transport.upstream_id().to_string();
        let (tx, rx) = oneshot::channel();
        *inner.join_waiter.lock() = Some(tx);
        inner.set_state(NodeState::Joining);

        info!(node = %inner.id, upstream = %target, "Joining mesh");
        if let Err(e) = inner.send_join_request(&target).await {
            inner.join_waiter.lock().take();
            inner.set_state(NodeState::Created);
            return Err(e);
        }

        match tokio::time::timeout(inner.config.join_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::invalid_state("launch", inner.state())),
            Err(_) => {
                inner.join_waiter.lock().take();
                inner.set_state(NodeState::Created);
                Err(Error::JoinTimeout {
                    upstream_id: target,
                    timeout_ms: inner.config.join_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stop the node; calling it again does nothing
    ///
    /// Pending requests are cancelled and the transport is released,
    /// which removes the node from the mesh. In-flight forwards are not
    /// awaited.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut *state, NodeState::Shutdown)
        };
        if previous == NodeState::Shutdown {
            return;
        }

        let _ = self.inner.shutdown_tx.send(true);
        let cancelled = self.inner.pending.cancel_all();
        self.inner.join_waiter.lock().take();
        self.inner.transport.shutdown().await;

        info!(node = %self.inner.id, cancelled, "Node shut down");
    }

    // ─────────────────────────────────────────────────────────────
    // Traffic
    // ─────────────────────────────────────────────────────────────

    /// Fan an update out to every other node of the mesh
    ///
    /// Returns the update id. A delivery failure to any neighbour is
    /// reported after the remaining neighbours were tried.
    pub async fn send_update(&self, payload: Payload) -> Result<Uuid> {
        let inner = &self.inner;
        inner.ensure_active("send_update")?;

        let update_id = Uuid::new_v4();
        inner.seen.lock().insert(update_id);

        let targets = inner.mesh().neighbours_of(&inner.id);
        let envelope = MessageEnvelope::new(Message::Update(UpdateMessage {
            update_id,
            originator_id: inner.id.clone(),
            payload,
        }));

        debug!(node = %inner.id, update = %update_id, targets = targets.len(), "Sending update");
        Counters::bump(&inner.counters.updates_sent);
        inner.transport.broadcast(&envelope, &targets).await?;

        Ok(update_id)
    }

    /// Fetch the current model parameters from the parameter source
    pub async fn request_model_parameters(&self) -> Result<Payload> {
        self.inner.request_params(ParamsKind::Model).await
    }

    /// Fetch the current updater parameters from the parameter source
    pub async fn request_updater_parameters(&self) -> Result<Payload> {
        self.inner.request_params(ParamsKind::Updater).await
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    pub fn add_updates_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.subscriptions.add_updates_subscriber(f)
    }

    pub fn add_model_params_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.subscriptions.add_model_params_subscriber(f)
    }

    pub fn add_updater_params_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.subscriptions.add_updater_params_subscriber(f)
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.inner.subscriptions.remove_subscriber(id)
    }

    /// Install the handler that answers requests of `kind` sent to this node
    pub fn add_request_consumer<F>(&self, kind: ParamsKind, f: F)
    where
        F: Fn(&ParamsRequest) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        if self.inner.consumers.set(kind, Arc::new(f)) {
            debug!(node = %self.inner.id, kind = %kind, "Replaced request consumer");
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    /// Local mesh view
    pub fn mesh(&self) -> Arc<Mesh> {
        self.inner.mesh()
    }

    /// Current upstream; the root reports itself
    pub fn upstream_id(&self) -> Option<String> {
        if self.inner.is_root {
            return Some(self.inner.id.clone());
        }
        self.mesh().upstream_of(&self.inner.id).map(str::to_string)
    }

    /// Node answering parameter requests
    pub fn parameter_source(&self) -> String {
        self.inner.parameter_source()
    }

    pub fn stats(&self) -> NodeStats {
        self.inner.counters.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ParameterServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterServer")
            .field("id", &self.inner.id)
            .field("root", &self.inner.is_root)
            .field("state", &self.inner.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Event Loop
// ─────────────────────────────────────────────────────────────────

/// Handle inbound deliveries one at a time until shutdown
async fn run_event_loop(
    inner: Arc<Inner>,
    mut inbox: mpsc::UnboundedReceiver<Delivery>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(node = %inner.id, "Event loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else {
                    if inner.state() != NodeState::Shutdown {
                        warn!(node = %inner.id, "Transport closed, node detached");
                        inner.set_state(NodeState::Detached);
                    }
                    break;
                };
                if inner.state() == NodeState::Shutdown {
                    break;
                }
                inner.handle_event(&delivery.event).await;
            }
        }
    }

    debug!(node = %inner.id, "Event loop terminated");
}

impl Inner {
    fn state(&self) -> NodeState {
        *self.state.read()
    }

    fn set_state(&self, next: NodeState) {
        let mut state = self.state.write();
        if *state == NodeState::Shutdown {
            return;
        }
        if *state != next {
            let previous = *state;
            *state = next;
            debug!(node = %self.id, from = %previous, to = %next, "State change");
        }
    }

    fn mesh(&self) -> Arc<Mesh> {
        Arc::clone(&self.mesh.read())
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        match self.state() {
            NodeState::Active => Ok(()),
            other => Err(Error::invalid_state(operation, other)),
        }
    }

    fn parameter_source(&self) -> String {
        self.config
            .parameter_source
            .clone()
            .unwrap_or_else(|| self.mesh().root_id().to_string())
    }

    fn drop_message(&self, reason: &str, msg_type: &str, from: &str) {
        Counters::bump(&self.counters.dropped_messages);
        debug!(node = %self.id, peer = %from, msg_type, reason, "Dropped message");
    }

    async fn send(&self, message: Message, to: &str) -> Result<()> {
        self.transport
            .send_message(MessageEnvelope::new(message), to)
            .await
    }

    async fn send_or_warn(&self, message: Message, to: &str) {
        let msg_type = message.type_name();
        if let Err(e) = self.send(message, to).await {
            warn!(node = %self.id, peer = %to, msg_type, error = %e.format_for_log(), "Send failed");
        }
    }

    async fn send_join_request(&self, to: &str) -> Result<()> {
        let request = Message::JoinRequest(JoinRequest {
            node_id: self.id.clone(),
            session: self.transport.session(),
            via: to.to_string(),
        });
        self.send(request, to).await
    }

    // ─────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::Message { from, envelope } => {
                if let Err(e) = PROTOCOL_VERSION.check(&envelope.version) {
                    warn!(node = %self.id, peer = %from, error = %e, "Incompatible envelope");
                    self.drop_message("protocol version", envelope.payload.type_name(), from);
                    return;
                }
                self.handle_message(from, &envelope.payload).await;
            }
            TransportEvent::PeerDisconnected { peer_id, session } => {
                self.handle_disconnect(peer_id, *session).await;
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, from: &str, message: &Message) {
        match message {
            Message::JoinRequest(req) => self.handle_join_request(from, req).await,
            Message::JoinAck(ack) => self.handle_join_ack(from, ack).await,
            Message::JoinRejected(rejected) => self.handle_join_rejected(from, rejected),
            Message::MeshUpdate(update) => self.handle_mesh_update(from, update).await,
            Message::Detached(notice) => self.handle_detached(from, notice).await,
            Message::Update(update) => self.handle_update(from, update).await,
            Message::ParamsRequest(req) => self.handle_params_request(from, req).await,
            Message::ParamsResponse(resp) => self.handle_params_response(from, resp),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Topology Handling
    // ─────────────────────────────────────────────────────────────

    async fn handle_join_request(&self, from: &str, req: &JoinRequest) {
        if !self.is_root {
            // Only the root places nodes
            let target = if self.state() == NodeState::Active {
                self.mesh().root_id().to_string()
            } else {
                self.transport.upstream_id().to_string()
            };
            debug!(node = %self.id, joiner = %req.node_id, to = %target, "Forwarding join request");
            self.send_or_warn(Message::JoinRequest(req.clone()), &target).await;
            return;
        }

        let node_id = req.node_id.clone();
        let session = req.session;
        let outcome = self.mutate_mesh(|recovery, mesh| recovery.on_join(mesh, &node_id, session));

        match outcome {
            Ok((decision, snapshot)) => {
                if decision.repeated {
                    debug!(node = %self.id, joiner = %req.node_id, via = %from, "Join repeated, acknowledging again");
                } else {
                    debug!(node = %self.id, joiner = %req.node_id, via = %from, "Join accepted");
                }
                let ack = Message::JoinAck(JoinAck {
                    node_id: req.node_id.clone(),
                    upstream_id: decision.upstream_id,
                    mesh: Arc::clone(&snapshot),
                    restart: decision.restart,
                });
                self.send_or_warn(ack, &req.node_id).await;

                if let Some(report) = decision.replaced {
                    self.notify_detached(&report, &snapshot, "superseded by a new session")
                        .await;
                }
                if !decision.repeated {
                    self.propagate_mesh(&snapshot, Some(&req.node_id)).await;
                }
            }
            Err(e) => {
                warn!(node = %self.id, joiner = %req.node_id, error = %e.format_for_log(), "Join rejected");
                if req.node_id == self.id {
                    return;
                }
                let rejected = Message::JoinRejected(JoinRejected {
                    node_id: req.node_id.clone(),
                    root_id: self.id.clone(),
                    reason: e.to_string(),
                });
                self.send_or_warn(rejected, &req.node_id).await;
            }
        }
    }

    async fn handle_join_ack(self: &Arc<Self>, from: &str, ack: &JoinAck) {
        if ack.node_id != self.id {
            self.drop_message("ack for another node", "JOIN_ACK", from);
            return;
        }
        let state = self.state();
        if state != NodeState::Joining {
            warn!(node = %self.id, state = %state, "Ignoring join acknowledgment");
            self.drop_message("not joining", "JOIN_ACK", from);
            return;
        }
        // A snapshot we already hold is fine as long as it lists us
        if !self.apply_snapshot(&ack.mesh) && !self.mesh().contains(&self.id) {
            self.drop_message("unusable snapshot", "JOIN_ACK", from);
            return;
        }

        self.set_state(NodeState::Active);
        info!(
            node = %self.id,
            upstream = %ack.upstream_id,
            version = ack.mesh.version(),
            restart = ack.restart,
            "Joined mesh"
        );

        let waiter = self.join_waiter.lock().take();
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(()));
        }

        if ack.restart && self.config.sync_on_restart {
            self.sync_parameters().await;
        }
    }

    fn handle_join_rejected(&self, from: &str, rejected: &JoinRejected) {
        if rejected.node_id != self.id || self.is_root {
            self.drop_message("rejection for another node", "JOIN_REJECTED", from);
            return;
        }

        let waiter = self.join_waiter.lock().take();
        match (waiter, self.state()) {
            (Some(tx), _) => {
                warn!(node = %self.id, reason = %rejected.reason, "Join rejected by root");
                self.set_state(NodeState::Created);
                let _ = tx.send(Err(Error::DuplicateJoin {
                    node_id: rejected.node_id.clone(),
                }));
            }
            (None, NodeState::Joining) => {
                warn!(node = %self.id, reason = %rejected.reason, "Rejoin rejected by root");
                self.set_state(NodeState::Detached);
            }
            // A stray duplicate of a join that already succeeded
            (None, state) => {
                debug!(node = %self.id, state = %state, "Ignoring join rejection");
            }
        }
    }

    async fn handle_mesh_update(&self, from: &str, update: &MeshUpdate) {
        if self.is_root {
            self.drop_message("root owns the mesh", "MESH_UPDATE", from);
            return;
        }
        if self.apply_snapshot(&update.mesh) {
            self.propagate_mesh(&update.mesh, None).await;
        }
    }

    async fn handle_detached(&self, from: &str, notice: &DetachedNotice) {
        if notice.node_id != self.id || self.is_root {
            self.drop_message("notice for another node", "DETACHED", from);
            return;
        }

        self.set_state(NodeState::Detached);
        warn!(
            node = %self.id,
            version = notice.mesh_version,
            reason = %notice.reason,
            "Detached from mesh"
        );

        if self.config.auto_rejoin {
            self.set_state(NodeState::Joining);
            info!(node = %self.id, root = %notice.root_id, "Rejoining mesh");
            if let Err(e) = self.send_join_request(&notice.root_id).await {
                warn!(node = %self.id, error = %e.format_for_log(), "Rejoin failed");
                self.set_state(NodeState::Detached);
            }
        }
    }

    async fn handle_disconnect(&self, peer_id: &str, session: Uuid) {
        if !self.is_root {
            debug!(node = %self.id, peer = %peer_id, "Peer disconnected");
            return;
        }

        let peer = peer_id.to_string();
        let outcome = self.mutate_mesh(|recovery, mesh| recovery.on_drop(mesh, &peer, Some(session)));

        match outcome {
            Ok((Some(report), snapshot)) => {
                self.notify_detached(&report, &snapshot, "upstream left the mesh")
                    .await;
                self.propagate_mesh(&snapshot, None).await;
            }
            Ok((None, _)) => {}
            Err(e) => {
                warn!(node = %self.id, peer = %peer_id, error = %e.format_for_log(), "Drop handling failed");
            }
        }
    }

    /// Run a root-side mutation on a copy of the mesh and publish it
    ///
    /// On error the previous snapshot stays in place. The mesh only
    /// changes when the version moved.
    fn mutate_mesh<T>(
        &self,
        f: impl FnOnce(&mut RecoveryManager, &mut Mesh) -> Result<T>,
    ) -> Result<(T, Arc<Mesh>)> {
        let mut recovery = self.recovery.lock();
        let mut current = self.mesh.write();

        let mut next = Mesh::clone(&current);
        let out = f(&mut recovery, &mut next)?;
        if next.version() != current.version() {
            *current = Arc::new(next);
        }
        Ok((out, Arc::clone(&current)))
    }

    /// Replace the local view with a newer, valid snapshot
    fn apply_snapshot(&self, snapshot: &Arc<Mesh>) -> bool {
        let mut current = self.mesh.write();
        if snapshot.version() <= current.version() && snapshot.root_id() == current.root_id() {
            debug!(
                node = %self.id,
                have = current.version(),
                got = snapshot.version(),
                "Ignoring stale mesh snapshot"
            );
            return false;
        }
        if let Err(e) = snapshot.validate() {
            warn!(node = %self.id, error = %e, "Rejected invalid mesh snapshot");
            return false;
        }

        *current = Arc::clone(snapshot);
        debug!(node = %self.id, version = snapshot.version(), "Applied mesh snapshot");
        true
    }

    /// Send a snapshot to this node's downstreams in that snapshot
    async fn propagate_mesh(&self, snapshot: &Arc<Mesh>, skip: Option<&str>) {
        for child in snapshot.downstreams_of(&self.id) {
            if Some(child.as_str()) == skip {
                continue;
            }
            let update = Message::MeshUpdate(MeshUpdate {
                mesh: Arc::clone(snapshot),
            });
            self.send_or_warn(update, child).await;
        }
    }

    async fn notify_detached(&self, report: &DropReport, snapshot: &Mesh, reason: &str) {
        for node_id in &report.detached {
            let notice = Message::Detached(DetachedNotice {
                node_id: node_id.clone(),
                root_id: self.id.clone(),
                mesh_version: snapshot.version(),
                reason: format!("{}: {}", reason, report.node_id),
            });
            self.send_or_warn(notice, node_id).await;
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Traffic Handling
    // ─────────────────────────────────────────────────────────────

    async fn handle_update(&self, from: &str, update: &UpdateMessage) {
        if self.state() != NodeState::Active {
            self.drop_message("not active", "UPDATE", from);
            return;
        }
        if update.originator_id == self.id {
            self.drop_message("own update", "UPDATE", from);
            return;
        }
        let fresh = self.seen.lock().insert(update.update_id);
        if !fresh {
            self.drop_message("duplicate update", "UPDATE", from);
            return;
        }

        Counters::bump(&self.counters.updates_received);
        self.subscriptions.updates.publish(&update.payload);

        let targets: Vec<String> = self
            .mesh()
            .neighbours_of(&self.id)
            .into_iter()
            .filter(|n| n != from && *n != update.originator_id)
            .collect();

        for target in &targets {
            self.send_or_warn(Message::Update(update.clone()), target).await;
            Counters::bump(&self.counters.updates_forwarded);
        }
    }

    async fn handle_params_request(&self, from: &str, req: &ParamsRequest) {
        let Some(consumer) = self.consumers.get(req.kind) else {
            warn!(
                node = %self.id,
                requester = %req.originator_id,
                kind = %req.kind,
                "No request consumer registered"
            );
            self.drop_message("no consumer", "PARAMS_REQUEST", from);
            return;
        };

        match consumer(req) {
            Ok(payload) => {
                let response = Message::ParamsResponse(ParamsResponse {
                    kind: req.kind,
                    request_id: req.request_id,
                    originator_id: self.id.clone(),
                    payload,
                });
                Counters::bump(&self.counters.requests_served);
                self.send_or_warn(response, &req.originator_id).await;
            }
            Err(e) => {
                warn!(node = %self.id, request_id = %req.request_id, error = %e, "Request consumer failed");
                self.drop_message("consumer failed", "PARAMS_REQUEST", from);
            }
        }
    }

    fn handle_params_response(&self, from: &str, resp: &ParamsResponse) {
        if !self
            .pending
            .complete(resp.request_id, resp.kind, resp.payload.clone())
        {
            self.drop_message("no matching request", "PARAMS_RESPONSE", from);
            return;
        }

        Counters::bump(&self.counters.responses_received);
        debug!(node = %self.id, request_id = %resp.request_id, kind = %resp.kind, "Parameters received");
        self.subscriptions.params(resp.kind).publish(&resp.payload);
    }

    // ─────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────

    /// Register and send a request, returning the id and its answer channel
    async fn issue_request(&self, kind: ParamsKind) -> Result<(Uuid, oneshot::Receiver<Payload>)> {
        let source = self.parameter_source();
        let (request_id, rx) = self.pending.register(kind);

        let request = Message::ParamsRequest(ParamsRequest {
            kind,
            request_id,
            originator_id: self.id.clone(),
        });
        if let Err(e) = self.send(request, &source).await {
            self.pending.forget(request_id);
            return Err(e);
        }

        debug!(node = %self.id, request_id = %request_id, kind = %kind, source = %source, "Request sent");
        Ok((request_id, rx))
    }

    async fn await_response(
        &self,
        kind: ParamsKind,
        request_id: Uuid,
        rx: oneshot::Receiver<Payload>,
    ) -> Result<Payload> {
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(Error::RequestCancelled {
                request_id: request_id.to_string(),
            }),
            Err(_) => {
                self.pending.forget(request_id);
                Err(Error::RequestTimeout {
                    request_id: request_id.to_string(),
                    kind: kind.to_string(),
                    timeout_ms: self.config.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn request_params(&self, kind: ParamsKind) -> Result<Payload> {
        self.ensure_active("request_parameters")?;
        let (request_id, rx) = self.issue_request(kind).await?;
        self.await_response(kind, request_id, rx).await
    }

    /// Ask for both parameter kinds after a restart
    ///
    /// Requests are sent from the event loop; the waits run detached so
    /// the loop can process the responses.
    async fn sync_parameters(self: &Arc<Self>) {
        for kind in ParamsKind::ALL {
            match self.issue_request(kind).await {
                Ok((request_id, rx)) => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.await_response(kind, request_id, rx).await {
                            warn!(node = %inner.id, error = %e.format_for_log(), "Restart sync failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(node = %self.id, kind = %kind, error = %e.format_for_log(), "Restart sync request failed");
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalConnector;

    fn quick_config() -> ServerConfig {
        ServerConfig {
            request_timeout: Duration::from_millis(200),
            join_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::default(), NodeState::Created);
        assert_eq!(NodeState::Active.to_string(), "ACTIVE");
        assert_eq!(NodeState::Shutdown.to_string(), "SHUTDOWN");
    }

    #[test]
    fn test_rejects_zero_fanout() {
        let connector = LocalConnector::new();
        let config = ServerConfig {
            fanout_limit: 0,
            ..ServerConfig::default()
        };
        let err = ParameterServer::new(config, connector.register_root("root")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_root_launch() {
        let connector = LocalConnector::new();
        let root = ParameterServer::new(quick_config(), connector.register_root("root")).unwrap();

        assert!(root.is_root());
        assert_eq!(root.state(), NodeState::Created);
        root.launch().await.unwrap();

        assert_eq!(root.state(), NodeState::Active);
        assert_eq!(root.upstream_id().as_deref(), Some("root"));
        assert_eq!(root.mesh().version(), 0);
        assert!(root.launch().await.is_err());
    }

    #[tokio::test]
    async fn test_operations_require_active() {
        let connector = LocalConnector::new();
        let root = ParameterServer::new(quick_config(), connector.register_root("root")).unwrap();

        let err = root.send_update(Payload::new(vec![1u8])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(root.request_model_parameters().await.is_err());
    }

    #[tokio::test]
    async fn test_join_and_update() {
        let connector = LocalConnector::new();
        let root = ParameterServer::new(quick_config(), connector.register_root("root")).unwrap();
        let node = ParameterServer::new(quick_config(), connector.register("a", "root")).unwrap();
        root.launch().await.unwrap();
        node.launch().await.unwrap();
        connector.wait_idle().await;

        assert_eq!(node.state(), NodeState::Active);
        assert_eq!(node.upstream_id().as_deref(), Some("root"));
        assert_eq!(*node.mesh(), *root.mesh());

        node.send_update(Payload::from_f32s(&[1.0; 8])).await.unwrap();
        connector.wait_idle().await;

        assert_eq!(root.stats().updates_received, 1);
        assert_eq!(node.stats().updates_received, 0);
        assert_eq!(node.stats().updates_sent, 1);
    }

    #[tokio::test]
    async fn test_join_timeout_without_root() {
        let connector = LocalConnector::new();
        // Upstream is registered but nobody runs its event loop
        let _silent = connector.register_root("root");
        let node = ParameterServer::new(quick_config(), connector.register("a", "root")).unwrap();

        let err = node.launch().await.unwrap_err();
        assert!(matches!(err, Error::JoinTimeout { .. }));
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_launch_fails_when_upstream_unreachable() {
        let connector = LocalConnector::new();
        let node = ParameterServer::new(quick_config(), connector.register("a", "root")).unwrap();

        let err = node.launch().await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DeliveryFailed);
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let connector = LocalConnector::new();
        let root = ParameterServer::new(quick_config(), connector.register_root("root")).unwrap();
        root.launch().await.unwrap();

        root.shutdown().await;
        root.shutdown().await;

        assert_eq!(root.state(), NodeState::Shutdown);
        assert!(!connector.is_connected("root"));
    }
}
