//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gradmesh::{LocalConnector, MeshBuildMode, ParameterServer, ServerConfig};

pub const ROOT_ID: &str = "root";

// ─────────────────────────────────────────────────────────────────
// Config Fixtures
// ─────────────────────────────────────────────────────────────────

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn valid_config_fixture() -> PathBuf {
    fixtures_dir().join("valid_node.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixtures_dir().join("invalid_node.toml")
}

// ─────────────────────────────────────────────────────────────────
// Cluster Fixtures
// ─────────────────────────────────────────────────────────────────

/// Server settings with timeouts short enough for tests
pub fn test_config(mode: MeshBuildMode, fanout_limit: usize) -> ServerConfig {
    ServerConfig {
        build_mode: mode,
        fanout_limit,
        request_timeout: Duration::from_millis(300),
        join_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

pub fn peer_id(index: usize) -> String {
    format!("peer-{:03}", index)
}

/// Count every update delivered to `server`
pub fn count_updates(server: &ParameterServer) -> Arc<AtomicU64> {
    let counter = Arc::new(AtomicU64::new(0));
    let c = Arc::clone(&counter);
    server.add_updates_subscriber(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    counter
}

pub fn count(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::SeqCst)
}

/// A root plus the peers that joined through it, all on one connector
pub struct Cluster {
    pub connector: Arc<LocalConnector>,
    pub config: ServerConfig,
    pub root: ParameterServer,
    pub peers: Vec<ParameterServer>,
}

impl Cluster {
    /// Launch a root and `peers` nodes, one join at a time
    pub async fn start(peers: usize, mode: MeshBuildMode, fanout_limit: usize) -> Self {
        Self::start_with(peers, test_config(mode, fanout_limit)).await
    }

    pub async fn start_with(peers: usize, config: ServerConfig) -> Self {
        let connector = LocalConnector::new();
        let root = ParameterServer::new(config.clone(), connector.register_root(ROOT_ID)).unwrap();
        root.launch().await.unwrap();

        let mut cluster = Self {
            connector,
            config,
            root,
            peers: Vec::with_capacity(peers),
        };
        for i in 0..peers {
            let peer = cluster.spawn(&peer_id(i));
            peer.launch().await.unwrap();
            cluster.peers.push(peer);
        }
        cluster.settle().await;
        cluster
    }

    /// A node registered on the connector but not launched yet
    pub fn spawn(&self, id: &str) -> ParameterServer {
        let transport = self.connector.register(id, ROOT_ID);
        ParameterServer::new(self.config.clone(), transport).unwrap()
    }

    /// Wait until no message is queued or being handled
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.connector.wait_idle())
            .await
            .expect("cluster did not go idle");
    }

    /// Cut `peers[index]` off and let the root process the drop
    pub async fn drop_peer(&self, index: usize) {
        assert!(self.connector.drop_connection(self.peers[index].id()));
        self.settle().await;
    }

    /// Start a fresh process for `peers[index]` and wait for the join
    pub async fn restart_peer(&mut self, index: usize) -> ParameterServer {
        self.restart_peer_with(index, |_| {}).await
    }

    /// Like [`Cluster::restart_peer`], running `setup` before launch
    pub async fn restart_peer_with(
        &mut self,
        index: usize,
        setup: impl FnOnce(&ParameterServer),
    ) -> ParameterServer {
        let peer = self.spawn(&peer_id(index));
        setup(&peer);
        peer.launch().await.unwrap();
        self.settle().await;
        self.peers[index] = peer.clone();
        peer
    }

    /// Root followed by every peer
    pub fn nodes(&self) -> impl Iterator<Item = &ParameterServer> {
        std::iter::once(&self.root).chain(self.peers.iter())
    }

    pub async fn shutdown(&self) {
        for peer in &self.peers {
            peer.shutdown().await;
        }
        self.root.shutdown().await;
    }
}
