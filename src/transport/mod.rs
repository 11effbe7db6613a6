//! Transport abstraction
//!
//! A transport moves envelopes between node ids and tells the node when a
//! peer goes away. It knows nothing about the mesh: routing decisions are
//! made by the coordinator, which only needs:
//! - its own id, session, and upstream-of-record
//! - point-to-point sends
//! - an inbound stream of [`Delivery`] values

pub mod local;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::MessageEnvelope;

pub use local::{LocalConnector, LocalTransport};

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Something that happened on the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An envelope arrived from a direct peer
    Message {
        from: String,
        envelope: MessageEnvelope,
    },

    /// A peer lost connectivity
    PeerDisconnected { peer_id: String, session: Uuid },
}

/// An inbound event plus whatever the transport needs to know about
/// its completion
///
/// Dropping the delivery marks it as handled.
pub struct Delivery {
    pub event: TransportEvent,
    receipt: Option<Box<dyn Any + Send>>,
}

impl Delivery {
    pub fn new(event: TransportEvent) -> Self {
        Self {
            event,
            receipt: None,
        }
    }

    /// Attach a value that lives exactly as long as the delivery
    pub fn with_receipt(event: TransportEvent, receipt: impl Any + Send) -> Self {
        Self {
            event,
            receipt: Some(Box::new(receipt)),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("tracked", &self.receipt.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────

/// Per-node connectivity
#[async_trait]
pub trait Transport: Send + Sync {
    /// Own node id
    fn id(&self) -> &str;

    /// Upstream-of-record; the root reports its own id
    fn upstream_id(&self) -> &str;

    /// Identifier of this transport instance
    ///
    /// A restarted process reusing a node id gets a new session.
    fn session(&self) -> Uuid;

    /// Check if this transport is the root's
    fn is_root(&self) -> bool {
        self.id() == self.upstream_id()
    }

    /// Open the inbound stream; can be called once
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    /// Send one envelope to a directly reachable node
    async fn send_message(&self, envelope: MessageEnvelope, destination: &str) -> Result<()>;

    /// Send to every destination, returning the first failure after
    /// trying them all
    async fn broadcast(&self, envelope: &MessageEnvelope, destinations: &[String]) -> Result<()> {
        let mut first_error = None;
        for destination in destinations {
            if let Err(e) = self.send_message(envelope.clone(), destination).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release connectivity; idempotent
    async fn shutdown(&self);
}
