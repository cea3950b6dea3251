//! Reporter contract.
//!
//! The engine emits everything through this sink: findings, artifacts,
//! check-completion events, and script prints. Terminal, CI-annotation and
//! SARIF renderers all live behind it, outside this crate.
//!
//! Also here: the replacement splitter reporters use to present whole-file
//! replacements as individual hunks.

use std::path::Path;
use std::time::Duration;

use crate::finding::{Finding, Level, Pos, Span};

/// Sink for everything a run produces.
///
/// Calls arrive from multiple worker threads in whatever order checks emit;
/// the only ordering guarantee is that a check's `check_completed` never
/// precedes that check's own emits.
pub trait Report: Send + Sync {
    /// A finding from a running check. An error result aborts the check.
    fn finding(&self, check: &str, finding: &Finding) -> anyhow::Result<()>;

    /// An artifact from a running check. `root` is the directory `file` is
    /// relative to when `content` is not inline.
    fn artifact(
        &self,
        check: &str,
        root: Option<&Path>,
        file: &str,
        content: Option<&[u8]>,
    ) -> anyhow::Result<()>;

    /// A check finished. `err` is set for abnormal failures; `level` is the
    /// highest level the check emitted.
    fn check_completed(
        &self,
        check: &str,
        duration: Duration,
        level: Level,
        err: Option<&anyhow::Error>,
    );

    /// `print()` from script code. `file`/`line` locate the call site.
    fn print(&self, file: &str, line: u32, message: &str);
}

/// A reporter that swallows everything. Useful as a default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReport;

impl Report for NoopReport {
    fn finding(&self, _check: &str, _finding: &Finding) -> anyhow::Result<()> {
        Ok(())
    }

    fn artifact(
        &self,
        _check: &str,
        _root: Option<&Path>,
        _file: &str,
        _content: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn check_completed(
        &self,
        _check: &str,
        _duration: Duration,
        _level: Level,
        _err: Option<&anyhow::Error>,
    ) {
    }

    fn print(&self, _file: &str, _line: u32, _message: &str) {}
}

/// One hunk of a whole-file replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementHunk {
    /// Lines replaced in the original, as a [`Span`]. Pure insertions have
    /// columns collapsed to `(1, 1)` and an end line one past the start.
    pub span: Span,
    /// The new text for the hunk; empty for pure deletions.
    pub replacement: String,
}

/// Split a whole-file replacement into per-change hunks.
///
/// Runs a longest-common-subsequence diff between the original and
/// replacement line arrays; each adjacent change-group becomes one hunk
/// spanning the group's original-side lines.
pub fn replacement_hunks(original: &str, replacement: &str) -> Vec<ReplacementHunk> {
    use similar::TextDiff;

    let diff = TextDiff::from_lines(original, replacement);
    let mut hunks = Vec::new();
    for group in diff.grouped_ops(0) {
        let mut old_start = usize::MAX;
        let mut old_end = 0usize;
        let mut new_text = String::new();
        let mut changed = false;
        for op in &group {
            match op.tag() {
                similar::DiffTag::Equal => continue,
                _ => changed = true,
            }
            old_start = old_start.min(op.old_range().start);
            old_end = old_end.max(op.old_range().end);
            for change in diff.iter_changes(op) {
                if change.tag() != similar::ChangeTag::Delete {
                    new_text.push_str(change.value());
                }
            }
        }
        if !changed {
            continue;
        }
        let span = if old_start == old_end {
            // Pure insertion before line `old_start + 1`: zero-width span at
            // column 1.
            Span {
                start: Pos {
                    line: old_start as u32 + 1,
                    col: 1,
                },
                end: Pos {
                    line: old_start as u32 + 2,
                    col: 1,
                },
            }
        } else {
            Span {
                start: Pos {
                    line: old_start as u32 + 1,
                    col: 0,
                },
                end: Pos {
                    line: old_end as u32,
                    col: 0,
                },
            }
        };
        hunks.push(ReplacementHunk {
            span,
            replacement: new_text,
        });
    }
    hunks
}
