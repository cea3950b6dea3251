//! Applying findings back to the files on disk.
//!
//! Only findings with exactly one replacement participate. Per file, spans
//! are normalized, findings are sorted by start line, overlapping ones are
//! dropped first-wins, and the survivors are applied back-to-front so
//! earlier findings' line numbers stay valid. Line ranges are inclusive;
//! end columns are exclusive.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;

use crate::finding::Finding;

/// Apply every applicable finding under `root`. Returns how many were
/// applied. Skipped findings (overlaps, spans past EOF) are left in place
/// silently.
pub fn apply(root: &Path, findings: &[Finding]) -> anyhow::Result<usize> {
    let mut by_file: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in findings {
        if finding.replacements.len() != 1 {
            continue;
        }
        let Some(file) = finding.file.as_deref() else {
            continue;
        };
        by_file.entry(file).or_default().push(finding);
    }

    let mut applied = 0;
    for (file, findings) in by_file {
        applied += apply_to_file(&root.join(file), findings)
            .with_context(|| format!("failed to fix {file}"))?;
    }
    Ok(applied)
}

/// A span normalized against the file's actual lines: 1-based, inclusive
/// lines, exclusive end column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NormSpan {
    start_line: usize,
    start_col: usize,
    end_line: usize,
    end_col: usize,
}

fn apply_to_file(path: &Path, mut findings: Vec<&Finding>) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let mode = std::fs::metadata(path)?.permissions();

    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    findings.sort_by_key(|f| f.span.start.line);

    // First-wins overlap policy, in start-line order.
    let mut survivors: Vec<(NormSpan, &str)> = Vec::new();
    let mut max_line = 0usize;
    for finding in findings {
        let Some(span) = normalize(finding, &lines) else {
            log::debug!(
                "fix: skipping finding past EOF in {} ({:?})",
                path.display(),
                finding.message
            );
            continue;
        };
        if span.start_line <= max_line {
            continue;
        }
        max_line = span.end_line;
        survivors.push((span, finding.replacements[0].as_str()));
    }

    // Back-to-front so earlier spans keep their line numbers.
    for (span, replacement) in survivors.iter().rev() {
        let prefix = before_col(&lines[span.start_line - 1], span.start_col);
        let suffix = from_col(&lines[span.end_line - 1], span.end_col);
        let merged = format!("{prefix}{replacement}{suffix}");
        lines.splice(span.start_line - 1..span.end_line, [merged]);
    }

    let applied = survivors.len();
    if applied > 0 {
        let mut out = lines.join("\n");
        if trailing_newline {
            out.push('\n');
        }
        std::fs::write(path, out)?;
        std::fs::set_permissions(path, mode)?;
    }
    Ok(applied)
}

/// Resolve the unset parts of a finding's span: no start line means the
/// whole file, no end line means the start line, no start column means 1,
/// no end column means one past the last column of the end line.
fn normalize(finding: &Finding, lines: &[String]) -> Option<NormSpan> {
    let line_count = lines.len().max(1);
    let span = finding.span;
    let (start_line, start_col, mut end_line, mut end_col) = if span.start.line == 0 {
        (1, 1, line_count, 0)
    } else {
        (
            span.start.line as usize,
            span.start.col.max(1) as usize,
            span.end.line as usize,
            span.end.col as usize,
        )
    };
    if end_line == 0 {
        end_line = start_line;
    }
    if start_line > lines.len() || end_line > lines.len() || end_line < start_line {
        return None;
    }
    if end_col == 0 {
        end_col = lines[end_line - 1].len() + 1;
    }
    Some(NormSpan {
        start_line,
        start_col,
        end_line,
        end_col,
    })
}

/// The part of `line` before 1-based column `col`, clamped to a char
/// boundary.
fn before_col(line: &str, col: usize) -> &str {
    let mut idx = (col - 1).min(line.len());
    while idx > 0 && !line.is_char_boundary(idx) {
        idx -= 1;
    }
    &line[..idx]
}

/// The part of `line` from 1-based column `col` on (the column itself is
/// excluded from the replaced range).
fn from_col(line: &str, col: usize) -> &str {
    let mut idx = (col - 1).min(line.len());
    while idx < line.len() && !line.is_char_boundary(idx) {
        idx += 1;
    }
    &line[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{Level, Pos, Span};

    fn finding(file: &str, span: Span, replacement: &str) -> Finding {
        Finding {
            check: "fix".into(),
            level: Level::Warning,
            message: "msg".into(),
            file: Some(file.into()),
            span,
            replacements: vec![replacement.into()],
        }
    }

    fn span(line: u32, col: u32, end_line: u32, end_col: u32) -> Span {
        Span {
            start: Pos { line, col },
            end: Pos {
                line: end_line,
                col: end_col,
            },
        }
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn single_line_range_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "hello world\nsecond\n");
        // Exclusive end column: columns 7..12 cover "world".
        let f = finding("a.txt", span(1, 7, 1, 12), "there");
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "hello there\nsecond\n"
        );
    }

    #[test]
    fn identity_replacement_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let original = "hello world\n";
        let path = write(&dir, "a.txt", original);
        let f = finding("a.txt", span(1, 3, 1, 8), &original[2..7]);
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(path).unwrap(), original);
    }

    #[test]
    fn unset_span_replaces_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "one\ntwo\nthree\n");
        let f = finding("a.txt", Span::default(), "rewritten\n");
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "rewritten\n\n");
    }

    #[test]
    fn unset_end_col_reaches_end_of_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "hello world\n");
        let f = finding("a.txt", span(1, 7, 0, 0), "you");
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello you\n");
    }

    #[test]
    fn overlapping_findings_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "l1\nl2\nl3\nl4\n");
        let a = finding("a.txt", span(1, 0, 2, 0), "A");
        let b = finding("a.txt", span(2, 0, 3, 0), "B");
        assert_eq!(apply(dir.path(), &[b, a]).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "A\nl3\nl4\n");
    }

    #[test]
    fn adjacent_findings_both_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "l1\nl2\nl3\n");
        let a = finding("a.txt", span(1, 0, 1, 0), "A");
        let b = finding("a.txt", span(3, 0, 3, 0), "C");
        assert_eq!(apply(dir.path(), &[a, b]).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "A\nl2\nC\n");
    }

    #[test]
    fn multiline_replacement_renumbers_later_lines_safely() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "a\nb\nc\n");
        let first = finding("a.txt", span(1, 0, 1, 0), "x\ny\nz");
        let last = finding("a.txt", span(3, 0, 3, 0), "C");
        assert_eq!(apply(dir.path(), &[first, last]).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x\ny\nz\nb\nC\n");
    }

    #[test]
    fn non_single_replacements_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "keep\n");
        let mut none = finding("a.txt", span(1, 0, 1, 0), "x");
        none.replacements.clear();
        let mut two = finding("a.txt", span(1, 0, 1, 0), "x");
        two.replacements.push("y".into());
        assert_eq!(apply(dir.path(), &[none, two]).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "keep\n");
    }

    #[test]
    fn span_past_eof_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.txt", "one\n");
        let f = finding("a.txt", span(9, 0, 9, 0), "x");
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "one\n");
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "tool.sh", "#!/bin/sh\necho old\n");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let f = finding("tool.sh", span(2, 6, 2, 9), "new");
        assert_eq!(apply(dir.path(), &[f]).unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "#!/bin/sh\necho new\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
