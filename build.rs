//! Build script for gradmesh
//!
//! Embeds git revision, build time, target and compiler into the binary
//! so `gradmesh version` can report exactly what is running.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let rustc_version = run("rustc", &["--version"]);

    let vars = [
        ("GRADMESH_GIT_HASH", git_hash),
        ("GRADMESH_GIT_BRANCH", git_branch),
        ("GRADMESH_GIT_DIRTY", git_dirty),
        (
            "GRADMESH_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("GRADMESH_TARGET", cargo_var("TARGET")),
        ("GRADMESH_PROFILE", cargo_var("PROFILE")),
        ("GRADMESH_HOST", cargo_var("HOST")),
        ("GRADMESH_RUSTC_VERSION", rustc_version),
    ];

    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Trimmed stdout of a command, "unknown" on any failure
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn cargo_var(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}
