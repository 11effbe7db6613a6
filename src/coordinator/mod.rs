//! Per-node coordination
//!
//! The parameter-server role every node plays:
//! - Lifecycle and join handling
//! - Update fan-out and request/response traffic
//! - Local subscriber streams

mod dedup;
mod requests;
mod server;
mod subscribers;

pub use dedup::SeenUpdates;
pub use requests::{PendingRequests, RequestConsumer, RequestConsumers};
pub use server::*;
pub use subscribers::{Channel, Subscriber, SubscriberId, Subscriptions};
