//! gradmesh: mesh topology and update propagation for distributed
//! parameter servers
//!
//! Nodes form a versioned tree rooted at a single root. Updates travel
//! once over every tree edge; parameter snapshots are fetched with
//! request/response pairs; dropped nodes are detached and rejoin fresh.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod recovery;
pub mod transport;
pub mod version;

pub use coordinator::{NodeState, NodeStats, ParameterServer, ServerConfig};
pub use error::{Error, ErrorCode, Result};
pub use mesh::{Mesh, MeshBuildMode, Node, TopologyBuilder};
pub use protocol::{ParamsKind, Payload};
pub use transport::{LocalConnector, LocalTransport, Transport};
