// Helpers are shared across test binaries; each binary uses a subset.
#![allow(dead_code)]

//! Test utilities: isolated git fixture repos, a closure-driven evaluator,
//! and a collecting reporter.
//!
//! Git commands run with a hermetic environment (no global/system config,
//! fixed identity and timestamps, `LANG=C`) so tests behave the same on any
//! machine and never touch the developer's configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use shac::check::{Check, CheckCallable, KwArgs, Param};
use shac::engine::ctx::CheckCtx;
use shac::finding::{Finding, Level};
use shac::report::Report;
use shac::script::{EvalError, Evaluator, LoadHost, LoadResult, SourceKey};

/// Route `log` output through the test harness when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An isolated git repository in a temp directory.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> TestRepo {
        init_logging();
        let repo = TestRepo {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        };
        repo.git(&["init", "-q", "-b", "main"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    pub fn remove(&self, path: &str) {
        std::fs::remove_file(self.dir.path().join(path)).unwrap();
    }

    /// Run git with a hermetic environment; panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", self.dir.path())
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "")
            .env("GIT_CONFIG_SYSTEM", "")
            .env("LANG", "C")
            .env("GIT_AUTHOR_NAME", "Test Author")
            .env("GIT_AUTHOR_EMAIL", "author@example.com")
            .env("GIT_AUTHOR_DATE", "2024-01-01T00:00:00Z")
            .env("GIT_COMMITTER_NAME", "Test Committer")
            .env("GIT_COMMITTER_EMAIL", "committer@example.com")
            .env("GIT_COMMITTER_DATE", "2024-01-01T00:00:00Z")
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {args:?} failed:\n{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    pub fn commit(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }
}

type ScriptFn = Box<dyn Fn(&dyn LoadHost) -> LoadResult + Send + Sync>;

/// Evaluator driven by one closure per source path; the closure plays the
/// role of the script's top-level statements.
#[derive(Default)]
pub struct ScriptedEvaluator {
    scripts: HashMap<String, ScriptFn>,
}

impl ScriptedEvaluator {
    pub fn new() -> ScriptedEvaluator {
        ScriptedEvaluator::default()
    }

    pub fn script(
        mut self,
        path: &str,
        body: impl Fn(&dyn LoadHost) -> LoadResult + Send + Sync + 'static,
    ) -> ScriptedEvaluator {
        self.scripts.insert(path.to_string(), Box::new(body));
        self
    }
}

impl Evaluator for ScriptedEvaluator {
    fn eval(&self, key: &SourceKey, _code: &str, host: &dyn LoadHost) -> LoadResult {
        match self.scripts.get(&key.path) {
            Some(body) => body(host),
            None => Err(EvalError::new(format!("no scripted body for {key}"))),
        }
    }
}

pub fn empty_exports() -> LoadResult {
    Ok(Arc::new(()))
}

/// Build a check from a plain closure taking `ctx`.
pub fn check(
    name: &str,
    body: impl Fn(&CheckCtx) -> anyhow::Result<()> + Send + Sync + 'static,
) -> Check {
    let callable = CheckCallable {
        name: name.to_string(),
        params: vec![Param::required("ctx")],
        has_varargs: false,
        has_kwargs: false,
        builtin: false,
        func: Arc::new(move |ctx, _args| body(ctx)),
    };
    Check::new(callable, None, false, KwArgs::new()).unwrap()
}

/// Like [`check`], but the closure also receives the bound keyword
/// arguments.
pub fn check_with_params(
    name: &str,
    params: Vec<Param>,
    body: impl Fn(&CheckCtx, &KwArgs) -> anyhow::Result<()> + Send + Sync + 'static,
) -> Check {
    let callable = CheckCallable {
        name: name.to_string(),
        params,
        has_varargs: false,
        has_kwargs: false,
        builtin: false,
        func: Arc::new(body),
    };
    Check::new(callable, None, false, KwArgs::new()).unwrap()
}

/// A completion event captured by [`CollectingReport`].
#[derive(Debug, Clone)]
pub struct Completion {
    pub check: String,
    pub level: Level,
    pub error: Option<String>,
}

/// Reporter that records everything for assertions.
#[derive(Default)]
pub struct CollectingReport {
    pub findings: Mutex<Vec<Finding>>,
    pub completions: Mutex<Vec<Completion>>,
    pub prints: Mutex<Vec<String>>,
    pub artifacts: Mutex<Vec<(String, Option<PathBuf>, String, Option<Vec<u8>>)>>,
}

impl CollectingReport {
    pub fn findings(&self) -> Vec<Finding> {
        self.findings.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().unwrap().clone()
    }

    pub fn prints(&self) -> Vec<String> {
        self.prints.lock().unwrap().clone()
    }
}

impl Report for CollectingReport {
    fn finding(&self, _check: &str, finding: &Finding) -> anyhow::Result<()> {
        self.findings.lock().unwrap().push(finding.clone());
        Ok(())
    }

    fn artifact(
        &self,
        check: &str,
        root: Option<&Path>,
        file: &str,
        content: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        self.artifacts.lock().unwrap().push((
            check.to_string(),
            root.map(Path::to_path_buf),
            file.to_string(),
            content.map(<[u8]>::to_vec),
        ));
        Ok(())
    }

    fn check_completed(
        &self,
        check: &str,
        _duration: std::time::Duration,
        level: Level,
        err: Option<&anyhow::Error>,
    ) {
        self.completions.lock().unwrap().push(Completion {
            check: check.to_string(),
            level,
            error: err.map(|e| format!("{e:#}")),
        });
    }

    fn print(&self, _file: &str, _line: u32, message: &str) {
        self.prints.lock().unwrap().push(message.to_string());
    }
}
