//! Build information embedded by `build.rs`

use std::fmt;

use crate::protocol::PROTOCOL_VERSION;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short git commit hash
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple
    pub target: &'static str,
    /// Cargo profile (debug/release)
    pub profile: &'static str,
    pub host: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GRADMESH_GIT_HASH"),
            git_branch: env!("GRADMESH_GIT_BRANCH"),
            git_dirty: env!("GRADMESH_GIT_DIRTY"),
            build_timestamp: env!("GRADMESH_BUILD_TIMESTAMP"),
            target: env!("GRADMESH_TARGET"),
            profile: env!("GRADMESH_PROFILE"),
            host: env!("GRADMESH_HOST"),
            rustc_version: env!("GRADMESH_RUSTC_VERSION"),
        }
    }

    /// Whether the working tree had uncommitted changes at build time
    pub fn is_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version with git hash, e.g. "0.1.0-1a2b3c4d"
    pub fn full_version(&self) -> String {
        let mut v = format!("{}-{}", self.version, self.git_hash);
        if self.is_dirty() {
            v.push_str("-dirty");
        }
        v
    }

    /// One-line version for log banners
    pub fn short_version(&self) -> String {
        format!("{} {} (protocol {})", self.name, self.version, PROTOCOL_VERSION)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(
            f,
            "  Git Hash:   {}{}",
            self.git_hash,
            if self.is_dirty() { " (dirty)" } else { "" }
        )?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {} ({})", self.build_timestamp, self.profile)?;
        writeln!(f)?;
        writeln!(f, "Target:")?;
        writeln!(f, "  Triple:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info_populated() {
        let info = build_info();
        assert_eq!(info.name, "gradmesh");
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }

    #[test]
    fn test_full_version_contains_hash() {
        let info = build_info();
        let full = info.full_version();
        assert!(full.starts_with(info.version));
        assert!(full.contains(info.git_hash));
    }

    #[test]
    fn test_display_lists_protocol() {
        let display = build_info().to_string();
        assert!(display.contains("Protocol:"));
        assert!(display.contains("Git Hash:"));
        assert!(display.contains("Target:"));
    }
}
