//! Mesh topology
//!
//! Versioned directory of cluster members and the placement policy
//! that decides where a joining node attaches.

mod builder;
mod topology;

pub use builder::*;
pub use topology::*;
