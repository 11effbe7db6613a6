//! gradmesh command-line entry point
//!
//! `simulate` builds a cluster of parameter servers on the in-process
//! transport and prints the resulting topology; `config` and `version`
//! are short utility commands.

mod cli;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use gradmesh::config::{self, NodeConfig};
use gradmesh::error::{Error, Result};
use gradmesh::logging::{self, LogGuards};
use gradmesh::version;
use gradmesh::{LocalConnector, ParameterServer, Payload, ServerConfig};

use crate::cli::{Cli, Commands, ConfigSubcommand};

const ROOT_ID: &str = "root";

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            print!("{}", version::build_info());
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone(), cli.config.as_deref());
        }
        Commands::Simulate { .. } => {}
    }

    let config = load_or_exit(cli.config.as_deref());

    // Keep the guards alive until exit so the file writer flushes
    let _log_guards: LogGuards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting {}",
        build.short_version()
    );

    let Commands::Simulate {
        peers,
        mode,
        fanout,
        drop: drop_index,
        update_from,
    } = cli.command
    else {
        return Ok(());
    };

    let mut server_config = config.server_config();
    if let Some(mode) = mode {
        server_config.build_mode = mode;
    }
    if let Some(fanout) = fanout {
        server_config.fanout_limit = fanout;
    }

    let plan = Simulation {
        peers,
        drop: drop_index,
        update_from,
        config: server_config,
    };
    if let Err(e) = plan.check() {
        exit_with(e);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("gradmesh")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    if let Err(e) = runtime.block_on(plan.run()) {
        exit_with(e);
    }
    Ok(())
}

fn load_or_exit(path: Option<&str>) -> NodeConfig {
    NodeConfig::load(path).unwrap_or_else(|e| exit_with(e))
}

fn exit_with(e: Error) -> ! {
    eprint!("{}", e.format_for_terminal());
    std::process::exit(e.exit_code());
}

// ─────────────────────────────────────────────────────────────────
// Simulation
// ─────────────────────────────────────────────────────────────────

struct Simulation {
    peers: usize,
    drop: Option<usize>,
    update_from: Option<usize>,
    config: ServerConfig,
}

/// A simulated member and the number of updates it has delivered
struct SimNode {
    server: ParameterServer,
    updates: Arc<AtomicU64>,
}

impl Simulation {
    fn check(&self) -> Result<()> {
        for (flag, index) in [("--drop", self.drop), ("--update-from", self.update_from)] {
            if let Some(i) = index {
                if i >= self.peers {
                    return Err(Error::Config(format!(
                        "{} index {} is out of range for {} peers",
                        flag, i, self.peers
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run(self) -> Result<()> {
        let connector = LocalConnector::new();

        let root = spawn_node(&connector, ROOT_ID, ROOT_ID, &self.config).await?;
        let mut peers = Vec::with_capacity(self.peers);
        for i in 0..self.peers {
            peers.push(spawn_node(&connector, &peer_id(i), ROOT_ID, &self.config).await?);
        }
        connector.wait_idle().await;

        info!(
            peers = self.peers,
            mode = %self.config.build_mode,
            version = root.server.mesh().version(),
            "Cluster assembled"
        );

        if let Some(i) = self.drop {
            let id = peer_id(i);
            let before = peers[i].server.upstream_id();
            connector.drop_connection(&id);
            connector.wait_idle().await;

            peers[i] = spawn_node(&connector, &id, ROOT_ID, &self.config).await?;
            connector.wait_idle().await;

            println!(
                "Dropped {} (upstream {}) and rejoined under {}",
                id,
                before.as_deref().unwrap_or("-"),
                peers[i].server.upstream_id().as_deref().unwrap_or("-")
            );
        }

        if let Some(i) = self.update_from {
            let payload = Payload::from_f32s(&[0.5; 16]);
            let update_id = peers[i].server.send_update(payload).await?;
            connector.wait_idle().await;
            println!("Sent update {} from {}", update_id, peers[i].server.id());
        }

        println!();
        let mut converged = true;
        let root_print = root.server.mesh().short_fingerprint();
        for node in std::iter::once(&root).chain(peers.iter()) {
            let mesh = node.server.mesh();
            let print = mesh.short_fingerprint();
            converged &= print == root_print;
            println!(
                "{:<10} state={:<8} upstream={:<10} downstreams=[{}] version={} updates={} mesh={}",
                node.server.id(),
                node.server.state(),
                node.server.upstream_id().as_deref().unwrap_or("-"),
                mesh.downstreams_of(node.server.id()).join(","),
                mesh.version(),
                node.updates.load(Ordering::Relaxed),
                print
            );
        }

        let mesh = root.server.mesh();
        println!();
        println!(
            "{} nodes, depth {}, version {}: {}",
            mesh.total_nodes(),
            mesh.depth(),
            mesh.version(),
            if converged { "converged" } else { "diverged" }
        );
        if !converged {
            warn!("Mesh views differ between nodes");
        }

        for node in peers.iter().chain(std::iter::once(&root)) {
            node.server.shutdown().await;
        }
        Ok(())
    }
}

fn peer_id(index: usize) -> String {
    format!("peer-{:03}", index)
}

async fn spawn_node(
    connector: &Arc<LocalConnector>,
    id: &str,
    upstream: &str,
    config: &ServerConfig,
) -> Result<SimNode> {
    let transport = connector.register(id, upstream);
    let server = ParameterServer::new(config.clone(), transport)?;

    let updates = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&updates);
    server.add_updates_subscriber(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    server.launch().await?;
    Ok(SimNode { server, updates })
}

// ─────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand, path: Option<&str>) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = NodeConfig::load(path)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path: target, force } => {
            let written = config::init_config(target.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate => {
            let cfg = load_or_exit(path);
            println!(
                "Configuration is valid. (node {}, upstream {}, {} mode)",
                cfg.node_id(),
                cfg.upstream_id(),
                cfg.mesh.build_mode
            );
        }
    }

    Ok(())
}
