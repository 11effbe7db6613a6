//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

use gradmesh::MeshBuildMode;

/// gradmesh - mesh topology and update propagation for parameter servers
///
/// Runs in-process clusters for inspection and manages node
/// configuration files.
#[derive(Parser, Debug)]
#[command(name = "gradmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "GRADMESH_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an in-process cluster and report its topology
    Simulate {
        /// Number of nodes joining the root
        #[arg(short, long, default_value_t = 16)]
        peers: usize,

        /// Placement policy (plain or mesh); defaults to the configured mode
        #[arg(short, long)]
        mode: Option<MeshBuildMode>,

        /// Downstream limit per node in mesh mode
        #[arg(short, long)]
        fanout: Option<usize>,

        /// Drop the peer at this index and let it rejoin
        #[arg(long, value_name = "INDEX")]
        drop: Option<usize>,

        /// Send one update from the peer at this index
        #[arg(long, value_name = "INDEX")]
        update_from: Option<usize>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show,

    /// Write a commented default configuration file
    Init {
        /// Where to create the file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,
}
