//! The fix mode end to end: run checks, apply single-replacement findings
//! back to disk.

mod common;

use std::sync::Arc;

use common::{CollectingReport, ScriptedEvaluator, check, empty_exports};
use shac::engine::{RunOptions, fix};
use shac::finding::{Level, Pos, Span};

fn span(line: u32, col: u32, end_line: u32, end_col: u32) -> Span {
    Span {
        start: Pos { line, col },
        end: Pos {
            line: end_line,
            col: end_col,
        },
    }
}

#[test]
fn fix_applies_single_replacement_findings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shac.star"), "").unwrap();
    std::fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();

    let evaluator = ScriptedEvaluator::new().script("shac.star", |host| {
        host.register_check(check("spelling", |ctx| {
            // Error level: a fix run must still reach application.
            ctx.emit().finding(
                Level::Error,
                "prefer there",
                Some("a.txt"),
                span(1, 7, 1, 12),
                vec!["there".into()],
            )
        }))
        .unwrap();
        empty_exports()
    });

    let report = Arc::new(CollectingReport::default());
    let mut opts = RunOptions::new(dir.path(), Arc::new(evaluator));
    opts.report = report.clone();
    let applied = fix(opts).unwrap();
    assert_eq!(applied, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "hello there\n"
    );
    // The finding still reached the regular reporter.
    assert_eq!(report.findings().len(), 1);
}

#[test]
fn fix_skips_overlaps_and_multi_replacement_findings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shac.star"), "").unwrap();
    std::fs::write(dir.path().join("a.txt"), "l1\nl2\nl3\n").unwrap();

    let evaluator = ScriptedEvaluator::new().script("shac.star", |host| {
        host.register_check(check("rewrites", |ctx| {
            ctx.emit().finding(
                Level::Warning,
                "first",
                Some("a.txt"),
                span(1, 0, 2, 0),
                vec!["ONE".into()],
            )?;
            // Overlaps the first finding: skipped.
            ctx.emit().finding(
                Level::Warning,
                "second",
                Some("a.txt"),
                span(2, 0, 3, 0),
                vec!["TWO".into()],
            )?;
            // Two replacements: never applied.
            ctx.emit().finding(
                Level::Warning,
                "ambiguous",
                Some("a.txt"),
                span(3, 0, 3, 0),
                vec!["A".into(), "B".into()],
            )
        }))
        .unwrap();
        empty_exports()
    });

    let mut opts = RunOptions::new(dir.path(), Arc::new(evaluator));
    opts.report = Arc::new(CollectingReport::default());
    let applied = fix(opts).unwrap();
    assert_eq!(applied, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "ONE\nl3\n"
    );
}

#[cfg(unix)]
#[test]
fn fix_preserves_the_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shac.star"), "").unwrap();
    let script = dir.path().join("run.sh");
    std::fs::write(&script, "#!/bin/sh\necho old\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let evaluator = ScriptedEvaluator::new().script("shac.star", |host| {
        host.register_check(check("modernize", |ctx| {
            ctx.emit().finding(
                Level::Warning,
                "new output",
                Some("run.sh"),
                span(2, 6, 2, 9),
                vec!["new".into()],
            )
        }))
        .unwrap();
        empty_exports()
    });

    let mut opts = RunOptions::new(dir.path(), Arc::new(evaluator));
    opts.report = Arc::new(CollectingReport::default());
    assert_eq!(fix(opts).unwrap(), 1);
    assert_eq!(
        std::fs::read_to_string(&script).unwrap(),
        "#!/bin/sh\necho new\n"
    );
    let mode = std::fs::metadata(&script).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}
