//! Join and drop handling on the root
//!
//! The root is the only node that mutates the mesh. [`RecoveryManager`]
//! owns the bookkeeping around those mutations: which session each
//! member joined with, and where departed members used to hang, so a
//! returning id is placed fresh instead of restoring stale edges.

use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mesh::{Mesh, TopologyBuilder};

/// Outcome of removing a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReport {
    /// Removed member
    pub node_id: String,

    /// Upstream it was attached to
    pub former_upstream: Option<String>,

    /// Its direct downstreams at removal time
    pub downstream_ids: Vec<String>,

    /// Every descendant detached with it
    pub detached: Vec<String>,
}

/// Outcome of accepting a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDecision {
    /// Upstream assigned to the joiner
    pub upstream_id: String,

    /// The id was a member before
    pub restart: bool,

    /// A stale tenure of the same id that was dropped first
    pub replaced: Option<DropReport>,

    /// The member repeated a join of its current tenure; the mesh is
    /// unchanged and only the acknowledgment is sent again
    pub repeated: bool,
}

/// Root-side membership bookkeeping
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    builder: TopologyBuilder,
    sessions: HashMap<String, Uuid>,
    departed: HashMap<String, Option<String>>,
}

impl RecoveryManager {
    pub fn new(builder: TopologyBuilder) -> Self {
        Self {
            builder,
            sessions: HashMap::new(),
            departed: HashMap::new(),
        }
    }

    pub fn builder(&self) -> &TopologyBuilder {
        &self.builder
    }

    /// Session a member joined with
    pub fn session_of(&self, node_id: &str) -> Option<Uuid> {
        self.sessions.get(node_id).copied()
    }

    /// Check if an id left the mesh and has not come back yet
    pub fn has_departed(&self, node_id: &str) -> bool {
        self.departed.contains_key(node_id)
    }

    /// Place a joining node
    ///
    /// A member id presenting its current session repeats a join that was
    /// already placed, e.g. after its acknowledgment arrived too late; the
    /// current placement is reported again. A member id presenting a
    /// different session belongs to a new process, so the old tenure is
    /// dropped before placing the node. The root's own id is a duplicate.
    /// On error the mesh is left untouched.
    pub fn on_join(&mut self, mesh: &mut Mesh, node_id: &str, session: Uuid) -> Result<JoinDecision> {
        if node_id == mesh.root_id() {
            return Err(Error::DuplicateJoin {
                node_id: node_id.to_string(),
            });
        }

        let mut replaced = None;
        if mesh.contains(node_id) {
            if self.sessions.get(node_id) == Some(&session) {
                let upstream_id = mesh
                    .upstream_of(node_id)
                    .ok_or_else(|| Error::invalid_topology(format!("member {} has no upstream", node_id)))?
                    .to_string();
                debug!(node = %node_id, upstream = %upstream_id, "Repeated join, acknowledging again");
                return Ok(JoinDecision {
                    upstream_id,
                    restart: false,
                    replaced: None,
                    repeated: true,
                });
            }
            info!(node = %node_id, session = %session, "New session for active member, dropping stale tenure");
            replaced = Some(self.drop_member(mesh, node_id)?);
        }

        let former_upstream = self.departed.get(node_id).cloned().flatten();
        let upstream = self
            .builder
            .place(mesh, node_id, former_upstream.as_deref());
        let upstream_id = mesh.add_node(node_id, &upstream)?;

        let restart = self.departed.remove(node_id).is_some();
        self.sessions.insert(node_id.to_string(), session);

        info!(
            node = %node_id,
            upstream = %upstream_id,
            restart,
            version = mesh.version(),
            "Node joined mesh"
        );

        Ok(JoinDecision {
            upstream_id,
            restart,
            replaced,
            repeated: false,
        })
    }

    /// Remove a member whose connection went away
    ///
    /// Returns `None` for the root, unknown ids, and notices whose session
    /// does not match the current tenure.
    pub fn on_drop(
        &mut self,
        mesh: &mut Mesh,
        node_id: &str,
        session: Option<Uuid>,
    ) -> Result<Option<DropReport>> {
        if node_id == mesh.root_id() || !mesh.contains(node_id) {
            debug!(node = %node_id, "Ignoring drop for non-member");
            return Ok(None);
        }

        if let Some(session) = session {
            if self.sessions.get(node_id) != Some(&session) {
                debug!(node = %node_id, session = %session, "Ignoring stale drop notice");
                return Ok(None);
            }
        }

        let report = self.drop_member(mesh, node_id)?;
        info!(
            node = %node_id,
            detached = report.detached.len(),
            version = mesh.version(),
            "Node dropped from mesh"
        );
        Ok(Some(report))
    }

    fn drop_member(&mut self, mesh: &mut Mesh, node_id: &str) -> Result<DropReport> {
        let tenure: Vec<(String, Option<String>)> = mesh
            .subtree(node_id)
            .into_iter()
            .map(|id| {
                let up = mesh.upstream_of(&id).map(str::to_string);
                (id, up)
            })
            .collect();

        let removal = mesh.remove_node(node_id)?;

        for (id, up) in tenure {
            self.sessions.remove(&id);
            self.departed.insert(id, up);
        }

        Ok(DropReport {
            node_id: removal.node.id,
            former_upstream: removal.node.upstream_id,
            downstream_ids: removal.downstream_ids,
            detached: removal.detached,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
