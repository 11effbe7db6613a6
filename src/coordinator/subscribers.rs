//! Local observer channels
//!
//! A node exposes three independent streams: raw updates, model
//! parameter snapshots and updater parameter snapshots. Each is a
//! [`Channel`] with its own registry. Publishing iterates a snapshot of
//! the registry, so callbacks may add or remove subscribers (even
//! themselves) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::protocol::{ParamsKind, Payload};

/// Handle returned on registration, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Subscriber callback; errors are logged and never stop delivery
pub type Subscriber = Arc<dyn Fn(&Payload) -> anyhow::Result<()> + Send + Sync>;

/// One multi-subscriber stream
pub struct Channel {
    name: &'static str,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
}

impl Channel {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriberId, subscriber: Subscriber) {
        self.subscribers.write().push((id, subscriber));
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every subscriber registered at call time
    ///
    /// Returns how many subscribers failed.
    pub fn publish(&self, payload: &Payload) -> usize {
        let snapshot: Vec<(SubscriberId, Subscriber)> = self.subscribers.read().clone();

        let mut failures = 0;
        for (id, subscriber) in snapshot {
            if let Err(e) = subscriber(payload) {
                failures += 1;
                warn!(channel = self.name, subscriber = id.0, error = %e, "Subscriber failed");
            }
        }
        failures
    }
}

/// The three streams of a node
pub struct Subscriptions {
    next_id: AtomicU64,
    pub updates: Channel,
    pub model_params: Channel,
    pub updater_params: Channel,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            updates: Channel::new("updates"),
            model_params: Channel::new("model_params"),
            updater_params: Channel::new("updater_params"),
        }
    }

    /// Channel for responses of the given kind
    pub fn params(&self, kind: ParamsKind) -> &Channel {
        match kind {
            ParamsKind::Model => &self.model_params,
            ParamsKind::Updater => &self.updater_params,
        }
    }

    fn register(&self, channel: &Channel, subscriber: Subscriber) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        channel.add(id, subscriber);
        id
    }

    pub fn add_updates_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(&self.updates, Arc::new(f))
    }

    pub fn add_model_params_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(&self.model_params, Arc::new(f))
    }

    pub fn add_updater_params_subscriber<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(&self.updater_params, Arc::new(f))
    }

    /// Remove a subscriber from whichever channel holds it
    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.updates.remove(id) || self.model_params.remove(id) || self.updater_params.remove(id)
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}
