//! In-process transport
//!
//! Every node of a simulated cluster registers with one shared
//! [`LocalConnector`], which routes envelopes between their inboxes.
//! Used by the `simulate` command and the cluster tests.
//!
//! The connector counts deliveries that are queued or being handled, so
//! callers can wait for the whole cluster to go quiet with
//! [`LocalConnector::wait_idle`]. Production nodes never wait on this.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Delivery, Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::protocol::MessageEnvelope;

// ─────────────────────────────────────────────────────────────────
// In-flight accounting
// ─────────────────────────────────────────────────────────────────

/// Holds one unit of the in-flight counter until dropped
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn acquire(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ─────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────

struct Route {
    session: Uuid,
    inbox: mpsc::UnboundedSender<Delivery>,
}

/// Shared switchboard for in-process nodes
pub struct LocalConnector {
    routes: RwLock<HashMap<String, Route>>,
    in_flight: Arc<watch::Sender<usize>>,
    framing: bool,
}

impl LocalConnector {
    /// Connector that hands envelopes over as values
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Connector that encodes every envelope to JSON and decodes it on
    /// the receiving side, like a socket transport would
    pub fn with_framing() -> Arc<Self> {
        Self::build(true)
    }

    fn build(framing: bool) -> Arc<Self> {
        let (in_flight, _) = watch::channel(0usize);
        Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
            in_flight: Arc::new(in_flight),
            framing,
        })
    }

    /// Register a node, replacing any previous registration of the same id
    ///
    /// The new transport gets a fresh session.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        upstream_id: impl Into<String>,
    ) -> Arc<LocalTransport> {
        let id = id.into();
        let session = Uuid::new_v4();
        let (inbox, rx) = mpsc::unbounded_channel();

        let previous = self
            .routes
            .write()
            .insert(id.clone(), Route { session, inbox });
        if previous.is_some() {
            debug!(node = %id, "Replaced existing local route");
        }

        Arc::new(LocalTransport {
            id,
            upstream_id: upstream_id.into(),
            session,
            connector: Arc::clone(self),
            inbox: Mutex::new(Some(rx)),
        })
    }

    /// Register the root of a cluster
    pub fn register_root(self: &Arc<Self>, id: impl Into<String>) -> Arc<LocalTransport> {
        let id = id.into();
        self.register(id.clone(), id)
    }

    /// Cut a node off and tell every remaining node about it
    ///
    /// Returns `false` if the node was not connected.
    pub fn drop_connection(&self, id: &str) -> bool {
        let removed = self.routes.write().remove(id);
        let Some(route) = removed else {
            return false;
        };

        debug!(node = %id, session = %route.session, "Dropping local connection");
        let peers: Vec<String> = self.routes.read().keys().cloned().collect();
        for peer in peers {
            let event = TransportEvent::PeerDisconnected {
                peer_id: id.to_string(),
                session: route.session,
            };
            // Peers that vanished meanwhile don't need the notice
            let _ = self.deliver(&peer, event);
        }
        true
    }

    /// Check if a node is currently registered
    pub fn is_connected(&self, id: &str) -> bool {
        self.routes.read().contains_key(id)
    }

    /// Ids of all registered nodes
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deliveries queued or being handled right now
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no delivery is queued or being handled anywhere
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in self, so this can't observe a closed channel
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn session_of(&self, id: &str) -> Option<Uuid> {
        self.routes.read().get(id).map(|r| r.session)
    }

    fn deliver(&self, to: &str, event: TransportEvent) -> Result<()> {
        let routes = self.routes.read();
        let route = routes
            .get(to)
            .ok_or_else(|| Error::delivery(to, "peer is not connected"))?;

        let delivery = Delivery::with_receipt(event, InFlight::acquire(&self.in_flight));
        route
            .inbox
            .send(delivery)
            .map_err(|_| Error::delivery(to, "peer inbox closed"))
    }

    fn reframe(&self, envelope: MessageEnvelope) -> Result<MessageEnvelope> {
        if !self.framing {
            return Ok(envelope);
        }
        let json = envelope.to_json()?;
        decode_frame(&json)
    }
}

/// Decode one JSON frame as it would arrive off a socket
fn decode_frame(json: &str) -> Result<MessageEnvelope> {
    MessageEnvelope::from_json(json).map_err(|e| Error::ProtocolMalformed {
        message: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// One node's handle on a [`LocalConnector`]
pub struct LocalTransport {
    id: String,
    upstream_id: String,
    session: Uuid,
    connector: Arc<LocalConnector>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl LocalTransport {
    /// Check if this transport still owns its route
    pub fn is_connected(&self) -> bool {
        self.connector.session_of(&self.id) == Some(self.session)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    fn session(&self) -> Uuid {
        self.session
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.inbox
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("connect", "CONNECTED"))
    }

    async fn send_message(&self, envelope: MessageEnvelope, destination: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportClosed {
                node_id: self.id.clone(),
            });
        }

        trace!(
            from = %self.id,
            to = %destination,
            msg_type = envelope.payload.type_name(),
            "Local send"
        );

        let envelope = self.connector.reframe(envelope)?;
        self.connector.deliver(
            destination,
            TransportEvent::Message {
                from: self.id.clone(),
                envelope,
            },
        )
    }

    async fn shutdown(&self) {
        if self.is_connected() {
            self.connector.drop_connection(&self.id);
        } else {
            warn!(node = %self.id, "Shutdown on a transport that no longer owns its route");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Payload, UpdateMessage};

    fn update(from: &str) -> MessageEnvelope {
        MessageEnvelope::new(Message::Update(UpdateMessage {
            update_id: Uuid::new_v4(),
            originator_id: from.to_string(),
            payload: Payload::from_f32s(&[1.0; 4]),
        }))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let connector = LocalConnector::new();
        let root = connector.register_root("root");
        let a = connector.register("a", "root");
        let mut root_rx = root.connect().await.unwrap();

        assert!(root.is_root());
        assert!(!a.is_root());

        a.send_message(update("a"), "root").await.unwrap();
        assert_eq!(connector.in_flight(), 1);

        let delivery = root_rx.recv().await.unwrap();
        match &delivery.event {
            TransportEvent::Message { from, envelope } => {
                assert_eq!(from, "a");
                assert_eq!(envelope.payload.type_name(), "UPDATE");
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(delivery);
        assert_eq!(connector.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let connector = LocalConnector::new();
        let root = connector.register_root("root");

        let err = root.send_message(update("root"), "ghost").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DeliveryFailed);
        assert_eq!(connector.in_flight(), 0);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let err = decode_frame("{\"payload\": 42").unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
        assert_eq!(err.code(), crate::error::ErrorCode::ProtocolMalformed);

        let json = update("a").to_json().unwrap();
        assert!(decode_frame(&json).is_ok());
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let connector = LocalConnector::new();
        let root = connector.register_root("root");

        assert!(root.connect().await.is_ok());
        assert!(root.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_drop_notifies_peers() {
        let connector = LocalConnector::new();
        let root = connector.register_root("root");
        let a = connector.register("a", "root");
        let mut root_rx = root.connect().await.unwrap();

        assert!(connector.drop_connection("a"));
        assert!(!connector.drop_connection("a"));
        assert!(!a.is_connected());

        let delivery = root_rx.recv().await.unwrap();
        match &delivery.event {
            TransportEvent::PeerDisconnected { peer_id, session } => {
                assert_eq!(peer_id, "a");
                assert_eq!(*session, a.session());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A dropped transport can't send anymore
        let err = a.send_message(update("a"), "root").await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed { .. }));
    }

    #[tokio::test]
    async fn test_reregister_gets_new_session() {
        let connector = LocalConnector::new();
        let first = connector.register("a", "root");
        let second = connector.register("a", "root");

        assert_ne!(first.session(), second.session());
        assert!(!first.is_connected());
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_framing_round_trips_envelopes() {
        let connector = LocalConnector::with_framing();
        let root = connector.register_root("root");
        let a = connector.register("a", "root");
        let mut root_rx = root.connect().await.unwrap();

        let envelope = update("a");
        let id = envelope.id;
        a.send_message(envelope, "root").await.unwrap();

        let delivery = root_rx.recv().await.unwrap();
        match delivery.event {
            TransportEvent::Message { envelope, .. } => {
                assert_eq!(envelope.id, id);
                match envelope.payload {
                    Message::Update(u) => {
                        assert_eq!(u.payload.to_f32s().unwrap(), vec![1.0; 4])
                    }
                    other => panic!("unexpected message {}", other.type_name()),
                }
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_drained() {
        let connector = LocalConnector::new();
        let root = connector.register_root("root");
        let a = connector.register("a", "root");
        let mut root_rx = root.connect().await.unwrap();

        a.send_message(update("a"), "root").await.unwrap();
        a.send_message(update("a"), "root").await.unwrap();

        let drain = tokio::spawn(async move {
            while let Some(delivery) = root_rx.recv().await {
                drop(delivery);
            }
        });

        connector.wait_idle().await;
        assert_eq!(connector.in_flight(), 0);
        drain.abort();
    }
}
