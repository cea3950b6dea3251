//! Subprocess isolation policy and the sandbox seam.
//!
//! The engine computes a [`SandboxConfig`] — mount set, network permission,
//! resolved command — and hands it to a [`Sandbox`] implementation to turn
//! into a spawnable command. The Linux isolator binary lives outside this
//! crate; the in-tree [`Passthrough`] implementation runs the command
//! directly and is what non-Linux hosts and tests use.

use std::path::{Path, PathBuf};
use std::process::Command;

/// One mount in the sandbox filesystem view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub path: PathBuf,
    pub writeable: bool,
}

impl Mount {
    pub fn read_only(path: impl Into<PathBuf>) -> Mount {
        Mount {
            path: path.into(),
            writeable: false,
        }
    }

    pub fn writeable(path: impl Into<PathBuf>) -> Mount {
        Mount {
            path: path.into(),
            writeable: true,
        }
    }
}

/// Everything a sandbox implementation needs to start one subprocess.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Resolved executable plus original arguments.
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    /// Full environment; the sandbox must not leak anything else in.
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub allow_network: bool,
}

/// OS paths mounted read-only into every sandbox on non-Windows hosts.
pub const COMMON_RO_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/urandom",
    "/dev/zero",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
    "/etc/ssl/certs",
    "/lib",
    "/lib64",
    "/usr/include",
    "/usr/lib",
];

/// The isolation seam.
///
/// Implementations may briefly hold the write side of the process-wide
/// start lock (see [`crate::exec::start_write`]) while preparing file
/// descriptors, so concurrent forks don't inherit them.
pub trait Sandbox: Send + Sync {
    /// Build the command to spawn for `config`. The caller sets up stdio
    /// and spawns under the start lock.
    fn command(&self, config: &SandboxConfig) -> anyhow::Result<Command>;
}

/// No isolation: run the command directly with the configured environment.
/// The mount policy is computed but not enforced.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Sandbox for Passthrough {
    fn command(&self, config: &SandboxConfig) -> anyhow::Result<Command> {
        let mut cmd = Command::new(&config.cmd[0]);
        cmd.args(&config.cmd[1..])
            .current_dir(&config.cwd)
            .env_clear();
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}

/// The read-only mount set shared by every invocation: fixed OS paths that
/// exist, plus every absolute existing directory on `path_var`.
pub fn common_mounts(path_var: &str) -> Vec<Mount> {
    let mut mounts: Vec<Mount> = COMMON_RO_PATHS
        .iter()
        .map(Path::new)
        .filter(|p| p.exists())
        .map(Mount::read_only)
        .collect();
    for dir in std::env::split_paths(path_var) {
        if dir.is_absolute() && dir.is_dir() && !mounts.iter().any(|m| m.path == dir) {
            mounts.push(Mount::read_only(dir));
        }
    }
    mounts
}
