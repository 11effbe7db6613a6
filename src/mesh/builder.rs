//! Placement policy for joining nodes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Mesh;
use crate::error::{Error, Result};

/// Default fan-out limit for MESH mode
pub const DEFAULT_FANOUT_LIMIT: usize = 8;

/// How joining nodes are attached, fixed per cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshBuildMode {
    /// Star: every node hangs off the root
    Plain,
    /// Tree with bounded fan-out per node
    Mesh,
}

impl Default for MeshBuildMode {
    fn default() -> Self {
        MeshBuildMode::Mesh
    }
}

impl fmt::Display for MeshBuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshBuildMode::Plain => write!(f, "PLAIN"),
            MeshBuildMode::Mesh => write!(f, "MESH"),
        }
    }
}

impl FromStr for MeshBuildMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(MeshBuildMode::Plain),
            "MESH" => Ok(MeshBuildMode::Mesh),
            other => Err(Error::config_field_invalid(
                "mesh.build_mode",
                format!("unknown build mode '{}', expected PLAIN or MESH", other),
            )),
        }
    }
}

/// Decides where a joining node attaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyBuilder {
    mode: MeshBuildMode,
    fanout_limit: usize,
}

impl TopologyBuilder {
    /// Create a builder; a zero fan-out limit is rejected in MESH mode
    pub fn new(mode: MeshBuildMode, fanout_limit: usize) -> Result<Self> {
        if mode == MeshBuildMode::Mesh && fanout_limit == 0 {
            return Err(Error::config_field_invalid(
                "mesh.fanout_limit",
                "fan-out limit must be at least 1 in MESH mode",
            ));
        }
        Ok(Self { mode, fanout_limit })
    }

    pub fn mode(&self) -> MeshBuildMode {
        self.mode
    }

    pub fn fanout_limit(&self) -> usize {
        self.fanout_limit
    }

    /// Pick the upstream for `joining`
    ///
    /// PLAIN always answers the root. MESH walks the tree breadth-first
    /// and takes the first node with spare fan-out, skipping the joining
    /// node itself and `exclude`. When every candidate is full the root
    /// takes the node regardless of its limit.
    pub fn place(&self, mesh: &Mesh, joining: &str, exclude: Option<&str>) -> String {
        let root = mesh.root_id();
        if self.mode == MeshBuildMode::Plain {
            return root.to_string();
        }

        mesh.bfs_order()
            .into_iter()
            .filter(|id| id != joining && Some(id.as_str()) != exclude)
            .find(|id| mesh.downstreams_of(id).len() < self.fanout_limit)
            .unwrap_or_else(|| root.to_string())
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self {
            mode: MeshBuildMode::default(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
        }
    }
}
