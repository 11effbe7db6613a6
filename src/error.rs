//! Error types for gradmesh
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI
//!
//! Topology errors are handled locally by the node that detects them;
//! delivery, timeout and join errors are returned to the calling API.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Delivery errors (3xx)
    DeliveryFailed = 300,
    TransportClosed = 301,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    Serialization = 402,

    // Topology errors (5xx)
    UnknownNode = 500,
    DuplicateNode = 501,
    CannotRemoveRoot = 502,
    InvalidTopology = 503,
    DuplicateJoin = 504,

    // Request errors (6xx)
    RequestTimeout = 600,
    RequestCancelled = 601,
    JoinTimeout = 602,

    // Lifecycle errors (7xx)
    InvalidState = 700,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Delivery errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Topology errors
            600..=699 => 60, // Request errors
            700..=799 => 70, // Lifecycle errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for mesh nodes
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Delivery Errors
    // ─────────────────────────────────────────────────────────────

    /// Destination unreachable
    #[error("Failed to deliver to {peer_id}: {message}")]
    Delivery { peer_id: String, message: String },

    /// Local transport is no longer usable
    #[error("Transport closed for node {node_id}")]
    TransportClosed { node_id: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed or unroutable message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Topology Errors
    // ─────────────────────────────────────────────────────────────

    /// Referenced node is not part of the mesh
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// Node id already present in the mesh
    #[error("Node {node_id} is already part of the mesh")]
    DuplicateNode { node_id: String },

    /// The root can only leave by shutting the cluster down
    #[error("Cannot remove root node {node_id}")]
    CannotRemoveRoot { node_id: String },

    /// Mutation or snapshot would break the tree invariant
    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    /// Join for a node that is already active with a live session
    #[error("Node {node_id} is already active in the mesh")]
    DuplicateJoin { node_id: String },

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────

    /// No matching response within the configured window
    #[error("Request {request_id} ({kind}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        request_id: String,
        kind: String,
        timeout_ms: u64,
    },

    /// Request abandoned because the node shut down
    #[error("Request {request_id} was cancelled")]
    RequestCancelled { request_id: String },

    /// No join acknowledgment within the configured window
    #[error("Join via {upstream_id} timed out after {timeout_ms}ms")]
    JoinTimeout { upstream_id: String, timeout_ms: u64 },

    // ─────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────

    /// Operation not allowed in the node's current state
    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState { operation: String, state: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Delivery { .. } => ErrorCode::DeliveryFailed,
            Error::TransportClosed { .. } => ErrorCode::TransportClosed,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Serialization(_) => ErrorCode::Serialization,

            Error::UnknownNode { .. } => ErrorCode::UnknownNode,
            Error::DuplicateNode { .. } => ErrorCode::DuplicateNode,
            Error::CannotRemoveRoot { .. } => ErrorCode::CannotRemoveRoot,
            Error::InvalidTopology { .. } => ErrorCode::InvalidTopology,
            Error::DuplicateJoin { .. } => ErrorCode::DuplicateJoin,

            Error::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Error::RequestCancelled { .. } => ErrorCode::RequestCancelled,
            Error::JoinTimeout { .. } => ErrorCode::JoinTimeout,

            Error::InvalidState { .. } => ErrorCode::InvalidState,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Delivery { .. }
                | Error::RequestTimeout { .. }
                | Error::JoinTimeout { .. }
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
        )
    }

    /// Check if the error is fatal (node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Check if the error belongs to the topology family
    pub fn is_topology(&self) -> bool {
        (500..600).contains(&(self.code() as u16))
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'gradmesh config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'gradmesh config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::Delivery { .. } => Some(
                "The peer is not reachable. It may have disconnected; the root will drop it from the mesh."
            ),
            Error::ProtocolVersion { .. } => Some(
                "Nodes in one cluster must run compatible gradmesh versions. Run 'gradmesh version'."
            ),

            Error::DuplicateJoin { .. } => Some(
                "Another live node already uses this id. Pick a unique node id or shut the other node down."
            ),
            Error::JoinTimeout { .. } => Some(
                "Check that the configured upstream is running and that the root is reachable."
            ),
            Error::RequestTimeout { .. } => Some(
                "The parameter source did not answer. Make sure a request consumer is registered on it."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a delivery error
    pub fn delivery(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Delivery {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Create an unknown node error
    pub fn unknown_node(node_id: impl Into<String>) -> Self {
        Error::UnknownNode {
            node_id: node_id.into(),
        }
    }

    /// Create an invalid topology error
    pub fn invalid_topology(message: impl Into<String>) -> Self {
        Error::InvalidTopology {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl fmt::Display) -> Self {
        Error::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
