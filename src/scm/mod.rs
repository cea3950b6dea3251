//! Source control abstraction.
//!
//! The engine is polymorphic over two backends — a git checkout and a raw
//! directory tree — plus two decorators: a gitignore-style filter and a
//! subdirectory view. All of them implement [`Scm`]: sorted listings of
//! affected / all files and per-file changed-line enumeration relative to an
//! upstream baseline.
//!
//! Listings are memoized per `include_deleted` value behind a mutex, so
//! concurrent checks hit git once.

use std::path::Path;
use std::sync::Arc;

pub mod cmd;
mod filter;
mod git;
mod raw;

pub use filter::{IgnoreFiltered, SubdirView};
pub use git::GitCheckout;
pub use raw::RawTree;

/// How a file changed relative to the upstream baseline.
///
/// `Untracked` is the blank action: untracked files and every file of a raw
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Added,
    Copied,
    Deleted,
    Modified,
    Renamed,
    Untracked,
}

impl Action {
    /// The single-letter git status code; empty for [`Action::Untracked`].
    pub fn code(self) -> &'static str {
        match self {
            Action::Added => "A",
            Action::Copied => "C",
            Action::Deleted => "D",
            Action::Modified => "M",
            Action::Renamed => "R",
            Action::Untracked => "",
        }
    }

    /// Parse the first letter of a `--name-status` code (`R100` → `Renamed`).
    pub fn from_status(status: &str) -> Option<Action> {
        match status.as_bytes().first()? {
            b'A' => Some(Action::Added),
            b'C' => Some(Action::Copied),
            b'D' => Some(Action::Deleted),
            b'M' => Some(Action::Modified),
            b'R' => Some(Action::Renamed),
            _ => None,
        }
    }
}

/// One repository file as seen through an SCM view.
///
/// `path` is relative to the view (a subdirectory view rewrites it);
/// `root_path` stays relative to the checkout root and is what diff
/// invocations use. Both use `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmFile {
    path: String,
    root_path: String,
    action: Action,
}

impl ScmFile {
    pub fn new(path: impl Into<String>, action: Action) -> Self {
        let path = path.into();
        ScmFile {
            root_path: path.clone(),
            path,
            action,
        }
    }

    /// Path relative to the SCM view, POSIX separators.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path relative to the checkout root, POSIX separators.
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_deleted(&self) -> bool {
        self.action == Action::Deleted
    }

    /// The same file re-rooted under a subdirectory view.
    fn with_view_path(&self, path: String) -> ScmFile {
        ScmFile {
            path,
            root_path: self.root_path.clone(),
            action: self.action,
        }
    }
}

/// Shared, immutable listing.
pub type FileList = Arc<Vec<Arc<ScmFile>>>;

/// A numbered line of new content: `(1-based line number, text)`.
pub type NumberedLine = (u32, String);

/// Capability set shared by every SCM backend and decorator.
///
/// Implementations are internally mutex-guarded; all methods may be called
/// from multiple check threads at once. Blocking calls consult the ambient
/// cancellation token.
pub trait Scm: Send + Sync {
    /// Absolute root of this view on disk.
    fn root(&self) -> &Path;

    /// Files changed relative to the upstream baseline, sorted by path.
    fn affected_files(&self, include_deleted: bool) -> anyhow::Result<FileList>;

    /// Every file known to the SCM, sorted by path. Deleted files are
    /// included only when `include_deleted` is set.
    fn all_files(&self, include_deleted: bool) -> anyhow::Result<FileList>;

    /// New lines of `file` relative to the upstream baseline. Deleted files
    /// and binary files yield an empty sequence.
    fn new_lines(&self, file: &ScmFile) -> anyhow::Result<Vec<NumberedLine>>;
}

/// Read a file on disk as numbered lines, counting from 1.
fn whole_file_lines(path: &Path) -> anyhow::Result<Vec<NumberedLine>> {
    use anyhow::Context;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(number_lines(&content))
}

fn number_lines(content: &str) -> Vec<NumberedLine> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i as u32 + 1, line.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_round_trip() {
        for action in [Action::Added, Action::Copied, Action::Deleted, Action::Modified, Action::Renamed] {
            assert_eq!(Action::from_status(action.code()), Some(action));
        }
        assert_eq!(Action::from_status("R100"), Some(Action::Renamed));
        assert_eq!(Action::from_status(""), None);
        assert_eq!(Action::Untracked.code(), "");
    }

    #[test]
    fn numbering_starts_at_one() {
        let lines = number_lines("a\nb\n");
        assert_eq!(lines, vec![(1, "a".to_string()), (2, "b".to_string())]);
        assert!(number_lines("").is_empty());
    }
}
