//! Hermetic check runner for source repositories.
//!
//! A project drops a configuration document and one or more script files at
//! known paths; the scripts register named *checks*, and the engine executes
//! them concurrently against the repository, collecting findings (structured
//! diagnostics tied to file spans) and artifacts. A separate mode applies
//! single-replacement findings back to the files on disk.
//!
//! The scripting language itself, the CLI, the reporter implementations, and
//! the process isolator binary are external collaborators: the engine drives
//! them through the [`script::Evaluator`], [`report::Report`], and
//! [`sandbox::Sandbox`] traits.

pub mod buffer;
pub mod cancel;
pub mod check;
pub mod doc;
pub mod engine;
pub mod exec;
pub mod finding;
pub mod fixer;
pub mod pkg;
pub mod report;
pub mod sandbox;
pub mod scm;
pub mod script;

pub use cancel::Cancellation;
pub use check::{Check, CheckCallable, Param};
pub use doc::Document;
pub use engine::{CheckFilter, RunOptions, fix, is_check_failure, run};
pub use finding::{Finding, Level, Span};
pub use report::Report;

/// Engine version as a `(major, minor, patch)` triple.
///
/// Compared against a document's `min_shac_version` and exposed to scripts
/// as `shac.version`.
pub fn version() -> (u32, u32, u32) {
    static VERSION: once_cell::sync::Lazy<(u32, u32, u32)> = once_cell::sync::Lazy::new(|| {
        let mut parts = env!("CARGO_PKG_VERSION").splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .expect("CARGO_PKG_VERSION is M.m.p")
        };
        (next(), next(), next())
    });
    *VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        let (major, minor, patch) = version();
        assert_eq!(
            format!("{major}.{minor}.{patch}"),
            env!("CARGO_PKG_VERSION")
        );
    }
}
