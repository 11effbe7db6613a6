//! Versioned mesh directory
//!
//! A [`Mesh`] is one node's view of the cluster: every member, its
//! upstream, and its downstreams. The upstream graph is always a tree
//! rooted at [`Mesh::root_id`]. Every structural mutation bumps the
//! version by exactly one.
//!
//! Each node owns its own copy. Owners keep it behind a lock and swap
//! whole snapshots, so a reader never observes a half-applied mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────

/// A single member of the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within the mesh
    pub id: String,

    /// Upstream node, `None` only for the root
    pub upstream_id: Option<String>,

    /// Downstream nodes in attach order
    #[serde(default)]
    pub downstream_ids: Vec<String>,
}

impl Node {
    fn new(id: impl Into<String>, upstream_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            upstream_id,
            downstream_ids: Vec::new(),
        }
    }

    /// Check if this node is the root of its mesh
    pub fn is_root(&self) -> bool {
        self.upstream_id.is_none()
    }

    /// Number of directly attached downstreams
    pub fn downstream_count(&self) -> usize {
        self.downstream_ids.len()
    }
}

/// Result of [`Mesh::remove_node`]
#[derive(Debug, Clone)]
pub struct Removal {
    /// The removed node as it was before removal
    pub node: Node,

    /// Former direct downstreams of the removed node
    pub downstream_ids: Vec<String>,

    /// Every descendant detached along with the node, BFS order
    pub detached: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────
// Mesh
// ─────────────────────────────────────────────────────────────────

/// Versioned tree of upstream/downstream relationships
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    version: u64,
    root_id: String,
    nodes: HashMap<String, Node>,
}

impl Mesh {
    /// Create a mesh containing only the root, at version 0
    pub fn new(root_id: impl Into<String>) -> Self {
        let root_id = root_id.into();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), Node::new(root_id.clone(), None));

        Self {
            version: 0,
            root_id,
            nodes,
        }
    }

    /// Current mesh version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Id of the root node
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Number of nodes, root included
    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node by id
    pub fn get_node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Check membership
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterate all nodes in unspecified order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Upstream id of a member, `None` for the root or unknown ids
    pub fn upstream_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.upstream_id.as_deref())
    }

    /// Downstream ids of a member, empty for unknown ids
    pub fn downstreams_of(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.downstream_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Tree neighbours of a member: its upstream followed by its downstreams
    pub fn neighbours_of(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(up) = self.upstream_of(id) {
            out.push(up.to_string());
        }
        out.extend(self.downstreams_of(id).iter().cloned());
        out
    }

    // ─────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────

    /// Attach `id` under `upstream_id`
    ///
    /// Returns the accepted upstream id. Fails without touching the mesh
    /// when the id is already a member or the upstream is unknown.
    pub fn add_node(&mut self, id: &str, upstream_id: &str) -> Result<String> {
        if self.nodes.contains_key(id) {
            return Err(Error::DuplicateNode {
                node_id: id.to_string(),
            });
        }

        let upstream = self
            .nodes
            .get_mut(upstream_id)
            .ok_or_else(|| Error::unknown_node(upstream_id))?;
        upstream.downstream_ids.push(id.to_string());

        self.nodes
            .insert(id.to_string(), Node::new(id, Some(upstream_id.to_string())));
        self.version += 1;

        Ok(upstream_id.to_string())
    }

    /// Remove `id` and detach its whole subtree
    ///
    /// Former downstreams are not reparented. The version is bumped once
    /// no matter how many descendants are detached.
    pub fn remove_node(&mut self, id: &str) -> Result<Removal> {
        if id == self.root_id {
            return Err(Error::CannotRemoveRoot {
                node_id: id.to_string(),
            });
        }
        if !self.nodes.contains_key(id) {
            return Err(Error::unknown_node(id));
        }

        let subtree = self.subtree(id);
        let mut removed = Vec::with_capacity(subtree.len());
        for member in &subtree {
            if let Some(node) = self.nodes.remove(member) {
                removed.push(node);
            }
        }

        // subtree() starts at `id`, so the first removed entry is the node itself
        let node = removed.remove(0);
        if let Some(up) = node.upstream_id.as_deref() {
            if let Some(parent) = self.nodes.get_mut(up) {
                parent.downstream_ids.retain(|d| d != id);
            }
        }

        self.version += 1;

        Ok(Removal {
            downstream_ids: node.downstream_ids.clone(),
            detached: removed.into_iter().map(|n| n.id).collect(),
            node,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Traversal
    // ─────────────────────────────────────────────────────────────

    /// Breadth-first order from the root, downstreams in attach order
    pub fn bfs_order(&self) -> Vec<String> {
        self.bfs_from(&self.root_id)
    }

    /// `id` followed by all of its descendants, breadth-first
    pub fn subtree(&self, id: &str) -> Vec<String> {
        self.bfs_from(id)
    }

    fn bfs_from(&self, start: &str) -> Vec<String> {
        let mut order = Vec::new();
        if !self.nodes.contains_key(start) {
            return order;
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        seen.insert(start.to_string());

        while let Some(current) = queue.pop_front() {
            for child in self.downstreams_of(&current) {
                if seen.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
            order.push(current);
        }

        order
    }

    /// Distance of a member from the root
    pub fn depth_of(&self, id: &str) -> Option<usize> {
        let mut current = self.nodes.get(id)?;
        let mut depth = 0;
        while let Some(up) = current.upstream_id.as_deref() {
            current = self.nodes.get(up)?;
            depth += 1;
            if depth > self.nodes.len() {
                return None;
            }
        }
        Some(depth)
    }

    /// Height of the tree (0 for a root-only mesh)
    pub fn depth(&self) -> usize {
        self.nodes
            .keys()
            .filter_map(|id| self.depth_of(id))
            .max()
            .unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────

    /// Check the tree invariant
    ///
    /// The root exists and has no upstream, every other node has a known
    /// upstream that lists it as a downstream, downstream lists hold no
    /// strangers or duplicates, and every node is reachable from the root.
    pub fn validate(&self) -> Result<()> {
        let root = self
            .nodes
            .get(&self.root_id)
            .ok_or_else(|| Error::invalid_topology(format!("root {} is missing", self.root_id)))?;
        if root.upstream_id.is_some() {
            return Err(Error::invalid_topology(format!(
                "root {} has an upstream",
                self.root_id
            )));
        }

        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(Error::invalid_topology(format!(
                    "node stored under {} claims id {}",
                    key, node.id
                )));
            }

            if node.id != self.root_id {
                let up = node.upstream_id.as_deref().ok_or_else(|| {
                    Error::invalid_topology(format!("node {} has no upstream", node.id))
                })?;
                let parent = self.nodes.get(up).ok_or_else(|| {
                    Error::invalid_topology(format!(
                        "node {} points at unknown upstream {}",
                        node.id, up
                    ))
                })?;
                if !parent.downstream_ids.contains(&node.id) {
                    return Err(Error::invalid_topology(format!(
                        "{} does not list {} as a downstream",
                        up, node.id
                    )));
                }
            }

            let mut seen = HashSet::new();
            for child in &node.downstream_ids {
                if !seen.insert(child) {
                    return Err(Error::invalid_topology(format!(
                        "{} lists downstream {} twice",
                        node.id, child
                    )));
                }
                match self.nodes.get(child) {
                    Some(c) if c.upstream_id.as_deref() == Some(node.id.as_str()) => {}
                    _ => {
                        return Err(Error::invalid_topology(format!(
                            "{} lists {} which is not attached to it",
                            node.id, child
                        )))
                    }
                }
            }
        }

        let reachable = self.bfs_order().len();
        if reachable != self.nodes.len() {
            return Err(Error::invalid_topology(format!(
                "{} of {} nodes unreachable from root",
                self.nodes.len() - reachable,
                self.nodes.len()
            )));
        }

        Ok(())
    }

    /// SHA-256 over the sorted (node, upstream) relation, hex encoded
    ///
    /// Equal meshes have equal fingerprints regardless of version.
    pub fn fingerprint(&self) -> String {
        let mut relation: Vec<(&str, &str)> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.upstream_id.as_deref().unwrap_or("")))
            .collect();
        relation.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.root_id.as_bytes());
        for (id, up) in relation {
            hasher.update([0u8]);
            hasher.update(id.as_bytes());
            hasher.update([1u8]);
            hasher.update(up.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// First 12 hex characters of [`Mesh::fingerprint`]
    pub fn short_fingerprint(&self) -> String {
        let mut fp = self.fingerprint();
        fp.truncate(12);
        fp
    }
}

/// Structural equality: same root and same upstream for every node.
/// The version is ignored.
impl PartialEq for Mesh {
    fn eq(&self, other: &Self) -> bool {
        self.root_id == other.root_id
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|(id, node)| {
                other
                    .nodes
                    .get(id)
                    .map(|o| o.upstream_id == node.upstream_id)
                    .unwrap_or(false)
            })
    }
}

impl Eq for Mesh {}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mesh v{} root={} nodes={} depth={}",
            self.version,
            self.root_id,
            self.nodes.len(),
            self.depth()
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
