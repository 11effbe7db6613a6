//! Wire protocol between mesh nodes
//!
//! Message types and envelope framing. Transports move envelopes; the
//! coordinator interprets them.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
