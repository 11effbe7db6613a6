//! Configuration system for gradmesh nodes
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (GRADMESH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values
//!
//! No mesh state is ever persisted; the file only describes how a node
//! joins and behaves.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::coordinator::ServerConfig;
use crate::error::{Error, Result};
use crate::mesh::{MeshBuildMode, TopologyBuilder, DEFAULT_FANOUT_LIMIT};

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and placement
    pub node: NodeSettings,

    /// Cluster-wide mesh policy
    pub mesh: MeshSettings,

    /// Request/response timing
    pub requests: RequestSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Unique node identifier (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Upstream-of-record the node sends its join request to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Whether this node is the mesh root
    pub root: bool,
}

/// Mesh policy settings; must agree across the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// PLAIN (star) or MESH (bounded fan-out tree)
    pub build_mode: MeshBuildMode,

    /// Maximum downstreams per node in MESH mode
    pub fanout_limit: usize,

    /// Rejoin automatically after a drop notice
    pub auto_rejoin: bool,

    /// Fetch model and updater parameters after a restart
    pub sync_on_restart: bool,

    /// Number of update ids remembered for duplicate suppression
    pub dedup_capacity: usize,
}

/// Request timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Parameter request timeout in milliseconds
    pub timeout_ms: u64,

    /// Join acknowledgment timeout in milliseconds
    pub join_timeout_ms: u64,

    /// Node answering parameter requests (defaults to the mesh root)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_source: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            upstream: None,
            root: true,
        }
    }
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            build_mode: MeshBuildMode::default(),
            fanout_limit: DEFAULT_FANOUT_LIMIT,
            auto_rejoin: true,
            sync_on_restart: true,
            dedup_capacity: 4096,
        }
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            join_timeout_ms: 30_000,
            parameter_source: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = Self::parse(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.resolve_identity();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document without touching env or disk
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::config_not_found(path))
            };
        }

        let search_paths = [
            PathBuf::from("gradmesh.toml"),
            dirs::config_dir()
                .map(|p| p.join("gradmesh").join("node.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".gradmesh").join("node.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/gradmesh/node.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Ok(val) = std::env::var("GRADMESH_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("GRADMESH_UPSTREAM") {
            self.node.upstream = Some(val);
        }
        if let Some(root) = parsed("GRADMESH_ROOT") {
            self.node.root = root;
        }

        if let Some(mode) = parsed("GRADMESH_BUILD_MODE") {
            self.mesh.build_mode = mode;
        }
        if let Some(n) = parsed("GRADMESH_FANOUT_LIMIT") {
            self.mesh.fanout_limit = n;
        }
        if let Some(b) = parsed("GRADMESH_AUTO_REJOIN") {
            self.mesh.auto_rejoin = b;
        }
        if let Some(b) = parsed("GRADMESH_SYNC_ON_RESTART") {
            self.mesh.sync_on_restart = b;
        }
        if let Some(n) = parsed("GRADMESH_DEDUP_CAPACITY") {
            self.mesh.dedup_capacity = n;
        }

        if let Some(n) = parsed("GRADMESH_REQUEST_TIMEOUT_MS") {
            self.requests.timeout_ms = n;
        }
        if let Some(n) = parsed("GRADMESH_JOIN_TIMEOUT_MS") {
            self.requests.join_timeout_ms = n;
        }
        if let Ok(val) = std::env::var("GRADMESH_PARAMETER_SOURCE") {
            self.requests.parameter_source = Some(val);
        }

        if let Ok(val) = std::env::var("GRADMESH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("GRADMESH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(b) = parsed("GRADMESH_LOG_JSON") {
            self.logging.json_format = b;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Assign a random node id when none is configured
    fn resolve_identity(&mut self) {
        if self.node.id.is_none() {
            let id = generate_node_id();
            debug!(node = %id, "Generated node id");
            self.node.id = Some(id);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        TopologyBuilder::new(self.mesh.build_mode, self.mesh.fanout_limit)?;

        if self.requests.timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "requests.timeout_ms",
                "request timeout must be greater than zero",
            ));
        }
        if self.requests.join_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "requests.join_timeout_ms",
                "join timeout must be greater than zero",
            ));
        }

        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    VALID_LEVELS.join(", ")
                ),
            ));
        }

        match (&self.node.upstream, self.node.root) {
            (None, false) => {
                return Err(Error::config_field_invalid(
                    "node.upstream",
                    "a non-root node needs an upstream to join through",
                ))
            }
            (Some(up), true) if Some(up) != self.node.id.as_ref() => {
                return Err(Error::config_field_invalid(
                    "node.upstream",
                    format!("root node cannot have upstream '{}'", up),
                ))
            }
            _ => {}
        }

        Ok(())
    }

    /// Node id; generated at load time when not configured
    pub fn node_id(&self) -> String {
        self.node.id.clone().unwrap_or_else(generate_node_id)
    }

    /// Upstream-of-record, the node itself for the root
    pub fn upstream_id(&self) -> String {
        match (&self.node.upstream, self.node.root) {
            (Some(up), false) => up.clone(),
            _ => self.node_id(),
        }
    }

    /// Runtime settings for a parameter server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            build_mode: self.mesh.build_mode,
            fanout_limit: self.mesh.fanout_limit,
            auto_rejoin: self.mesh.auto_rejoin,
            sync_on_restart: self.mesh.sync_on_restart,
            dedup_capacity: self.mesh.dedup_capacity,
            request_timeout: Duration::from_millis(self.requests.timeout_ms),
            join_timeout: Duration::from_millis(self.requests.join_timeout_ms),
            parameter_source: self.requests.parameter_source.clone(),
        }
    }
}

/// Random `node-xxxxxxxx` identifier
pub fn generate_node_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("node-{}", &uuid[..8])
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gradmesh")
        .join("node.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    format!(
        r#"# gradmesh node configuration

[node]
# Unique node identifier (auto-generated if not set)
# id = "node-1a2b3c4d"

# The root accepts joins and owns the authoritative mesh.
root = true

# Non-root nodes send their join request here
# upstream = "root"

[mesh]
# PLAIN: every node attaches to the root
# MESH: bounded fan-out tree, filled breadth-first
build_mode = "MESH"

# Maximum downstreams per node in MESH mode
fanout_limit = {fanout}

# Rejoin automatically after being detached from the mesh
auto_rejoin = true

# Fetch model and updater parameters after rejoining
sync_on_restart = true

# Update ids remembered for duplicate suppression
dedup_capacity = 4096

[requests]
# Parameter request timeout in milliseconds
timeout_ms = 30000

# Join acknowledgment timeout in milliseconds
join_timeout_ms = 30000

# Node answering parameter requests (defaults to the root)
# parameter_source = "root"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.gradmesh/logs/node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Use JSON format for logs
json_format = false
"#,
        fanout = DEFAULT_FANOUT_LIMIT
    )
}
