//! Request/response bookkeeping
//!
//! [`PendingRequests`] tracks requests this node issued and is waiting
//! on. [`RequestConsumers`] holds the handlers that answer requests
//! other nodes send here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::{ParamsKind, ParamsRequest, Payload};

// ─────────────────────────────────────────────────────────────────
// Outgoing
// ─────────────────────────────────────────────────────────────────

/// Requests waiting for a response
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<Uuid, (ParamsKind, oneshot::Sender<Payload>)>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh request and get the receiving half of its answer
    pub fn register(&self, kind: ParamsKind) -> (Uuid, oneshot::Receiver<Payload>) {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(request_id, (kind, tx));
        (request_id, rx)
    }

    /// Resolve a request; `false` if it's unknown or of another kind
    pub fn complete(&self, request_id: Uuid, kind: ParamsKind, payload: Payload) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(&request_id) {
            Some((expected, _)) if *expected == kind => {}
            _ => return false,
        }
        match inner.remove(&request_id) {
            // Receiver may have timed out already
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Forget a request, e.g. after its waiter timed out
    pub fn forget(&self, request_id: Uuid) {
        self.inner.lock().remove(&request_id);
    }

    /// Drop every pending request; waiters observe cancellation
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.len();
        inner.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────
// Incoming
// ─────────────────────────────────────────────────────────────────

/// Produces the payload that answers a request
pub type RequestConsumer = Arc<dyn Fn(&ParamsRequest) -> anyhow::Result<Payload> + Send + Sync>;

/// One consumer per request kind; registering again replaces it
#[derive(Default)]
pub struct RequestConsumers {
    inner: RwLock<HashMap<ParamsKind, RequestConsumer>>,
}

impl RequestConsumers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a consumer, returning `true` if one was replaced
    pub fn set(&self, kind: ParamsKind, consumer: RequestConsumer) -> bool {
        self.inner.write().insert(kind, consumer).is_some()
    }

    pub fn get(&self, kind: ParamsKind) -> Option<RequestConsumer> {
        self.inner.read().get(&kind).cloned()
    }
}
