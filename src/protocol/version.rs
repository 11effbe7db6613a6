//! Protocol versioning
//!
//! Every envelope carries the sender's protocol version. A node drops
//! envelopes it cannot understand instead of guessing at their layout.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a node speaking `self` can read messages written at `other`
    ///
    /// Majors must match; a reader understands any minor up to its own.
    pub fn can_read(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Like [`ProtocolVersion::can_read`], as a `Result` for envelope checks
    pub fn check(&self, remote: &ProtocolVersion) -> Result<()> {
        if self.can_read(remote) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                expected: self.to_string(),
                actual: remote.to_string(),
            })
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
