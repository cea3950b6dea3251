//! The two-phase execution engine.
//!
//! Phase 1 loads the entry-point script (serially within an engine state,
//! concurrently across states) and registers checks. Phase 2 dispatches one
//! closure per check onto a bounded work channel drained by a worker pool
//! sized to the host CPU count plus two. With multi-root recursion every
//! discovered entry point gets its own engine state, all sharing the same
//! channel and pool so per-check parallelism spans the whole repository.
//!
//! A run fails when any check fails abnormally, or — after all checks
//! finish — when any check emitted a finding at level `error`. The first
//! abnormal failure cancels the run; errors observed after cancellation are
//! suppressed so one root cause reaches the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, anyhow, bail};
use path_slash::PathExt as _;

use crate::cancel::{self, Cancellation};
use crate::check::{Check, CheckRegistry, RegisteredCheck};
use crate::doc::Document;
use crate::exec::default_concurrency;
use crate::finding::{Finding, Level};
use crate::pkg;
use crate::report::{NoopReport, Report};
use crate::sandbox::{Passthrough, Sandbox};
use crate::scm::{GitCheckout, IgnoreFiltered, RawTree, Scm, SubdirView};
use crate::script::{Evaluator, LoadSink, ScriptEnv, SourceKey};

pub mod ctx;

use ctx::CheckCtx;

/// Default entry-point basename.
pub const DEFAULT_ENTRY_POINT: &str = "shac.star";

/// The distinguished run result when at least one check emitted an
/// error-level finding or failed abnormally.
#[derive(Debug, Clone, Copy)]
pub struct CheckFailedError;

impl std::fmt::Display for CheckFailedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a check failed")
    }
}

impl std::error::Error for CheckFailedError {}

/// Returns true if `err` is the distinguished "a check failed" result.
pub fn is_check_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<CheckFailedError>())
}

/// Phase-2 selection of which registered checks run.
#[derive(Debug, Clone, Default)]
pub struct CheckFilter {
    /// When non-empty, only these names run.
    pub allow: Vec<String>,
    /// Names that never run.
    pub deny: Vec<String>,
    /// Run only formatter checks.
    pub formatter_only: bool,
    /// Run only non-formatter checks.
    pub non_formatter_only: bool,
}

impl CheckFilter {
    fn matches(&self, check: &Check) -> bool {
        if self.formatter_only && !check.formatter {
            return false;
        }
        if self.non_formatter_only && check.formatter {
            return false;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|n| *n == check.name) {
            return false;
        }
        !self.deny.iter().any(|n| *n == check.name)
    }
}

/// Everything one run needs.
pub struct RunOptions {
    pub root: PathBuf,
    /// Parsed configuration document; validated before anything loads.
    pub doc: Document,
    /// Entry-point basename, `shac.star` unless overridden.
    pub entry_point: String,
    pub evaluator: Arc<dyn Evaluator>,
    pub report: Arc<dyn Report>,
    pub sandbox: Arc<dyn Sandbox>,
    /// Consider all files instead of the affected set; `new_lines` yields
    /// whole files.
    pub all_files: bool,
    /// Discover every directory containing the entry-point file and run
    /// each in its own engine state.
    pub recurse: bool,
    pub filter: CheckFilter,
    /// Run-time variable overrides; every name must be declared in the
    /// document.
    pub vars: HashMap<String, String>,
    pub cancel: Cancellation,
}

impl RunOptions {
    pub fn new(root: impl Into<PathBuf>, evaluator: Arc<dyn Evaluator>) -> RunOptions {
        RunOptions {
            root: root.into(),
            doc: Document::default(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            evaluator,
            report: Arc::new(NoopReport),
            sandbox: Arc::new(Passthrough),
            all_files: false,
            recurse: false,
            filter: CheckFilter::default(),
            vars: HashMap::new(),
            cancel: Cancellation::new(),
        }
    }
}

/// One engine state: a subdir-scoped SCM view, a check registry, a temp
/// root, and the load-time print flag.
struct EngineState {
    subdir: String,
    scm: Arc<dyn Scm>,
    registry: Arc<CheckRegistry>,
    tmp: PathBuf,
    printed: AtomicBool,
    report: Arc<dyn Report>,
}

impl LoadSink for EngineState {
    fn register_check(&self, check: Check) -> anyhow::Result<()> {
        self.registry.register(check)
    }

    fn print(&self, file: &str, line: u32, message: &str) {
        self.printed.store(true, Ordering::SeqCst);
        self.report.print(file, line, message);
    }
}

/// Shared run-wide context for phase 2.
struct Shared {
    checkout_root: PathBuf,
    doc: Arc<Document>,
    sandbox: Arc<dyn Sandbox>,
    vars: Arc<HashMap<String, String>>,
    report: Arc<dyn Report>,
    cancel: Cancellation,
    /// First abnormal check failure; wins the run result.
    failure: Mutex<Option<anyhow::Error>>,
    error_seen: AtomicBool,
}

type Job = Box<dyn FnOnce() + Send>;

/// Run every registered check once. See the module docs for phases and the
/// failure contract.
pub fn run(options: RunOptions) -> anyhow::Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("shac-")
        .tempdir()
        .context("failed to create run temp root")?;
    run_in(options, scratch.path().to_path_buf())
}

fn run_in(options: RunOptions, scratch: PathBuf) -> anyhow::Result<()> {
    options.doc.validate(crate::version())?;
    let root = dunce::canonicalize(&options.root)
        .with_context(|| format!("failed to resolve root {}", options.root.display()))?;

    // SCM selection: git checkout when available, raw tree otherwise. The
    // checkout root may be above the run root; a subdirectory view brings
    // listings back to run-root-relative paths.
    let (mut scm_base, checkout_root, commit_hash): (Arc<dyn Scm>, PathBuf, Option<String>) =
        match GitCheckout::new(&root, options.all_files) {
            Ok(git) => {
                let head = git.head().to_string();
                let top = git.root().to_path_buf();
                (Arc::new(git), top, Some(head))
            }
            Err(err) => {
                log::debug!("not a git checkout ({err:#}); using raw tree");
                (Arc::new(RawTree::new(&root)?), root.clone(), None)
            }
        };
    if root != checkout_root {
        let rel = root
            .strip_prefix(&checkout_root)
            .context("run root is outside its checkout")?;
        scm_base = Arc::new(SubdirView::new(scm_base, &rel.to_slash_lossy()));
    }
    let scm: Arc<dyn Scm> = if options.doc.ignore.is_empty() {
        scm_base
    } else {
        Arc::new(IgnoreFiltered::new(scm_base, &options.doc.ignore)?)
    };

    let packages = Arc::new(pkg::retrieve(&options.doc, &root, &scratch)?);

    let doc = Arc::new(options.doc);
    let vars = Arc::new(resolve_vars(&doc, options.vars)?);

    let subdirs = discover_entry_points(&scm, &root, &options.entry_point, options.recurse)?;
    let script_env = Arc::new(ScriptEnv::new(
        packages,
        options.evaluator,
        options.entry_point.clone(),
        commit_hash,
    ));

    let states: Vec<Arc<EngineState>> = subdirs
        .iter()
        .enumerate()
        .map(|(i, subdir)| -> anyhow::Result<Arc<EngineState>> {
            let tmp = scratch.join(format!("state{i}"));
            std::fs::create_dir_all(&tmp)?;
            let view: Arc<dyn Scm> = if subdir.is_empty() {
                scm.clone()
            } else {
                Arc::new(SubdirView::new(scm.clone(), subdir))
            };
            Ok(Arc::new(EngineState {
                subdir: subdir.clone(),
                scm: view,
                registry: Arc::new(CheckRegistry::new()),
                tmp,
                printed: AtomicBool::new(false),
                report: options.report.clone(),
            }))
        })
        .collect::<anyhow::Result<_>>()?;

    let shared = Arc::new(Shared {
        checkout_root,
        doc,
        sandbox: options.sandbox,
        vars,
        report: options.report,
        cancel: options.cancel,
        failure: Mutex::new(None),
        error_seen: AtomicBool::new(false),
    });

    // The shared work channel and its pool. A `None` on the channel tells a
    // worker to exit; the worker re-posts it so a single sentinel drains
    // the whole pool.
    let worker_count = default_concurrency();
    let (tx, rx) = crossbeam_channel::bounded::<Option<Job>>(worker_count * 2);
    let workers: Vec<_> = (0..worker_count)
        .map(|_| {
            let rx = rx.clone();
            let tx = tx.clone();
            let cancel = shared.cancel.clone();
            std::thread::spawn(move || {
                while let Ok(item) = rx.recv() {
                    match item {
                        Some(job) => {
                            // Cancellation drops pending work.
                            if !cancel.is_cancelled() {
                                cancel::scope(&cancel, job);
                            }
                        }
                        None => {
                            let _ = tx.send(None);
                            break;
                        }
                    }
                }
            })
        })
        .collect();

    // Phase 1, parallel across states; each state enqueues its phase-2
    // closures as soon as its load completes.
    let entry_point = options.entry_point.clone();
    let filter = options.filter.clone();
    let load_errors: Vec<anyhow::Error> = std::thread::scope(|scope| {
        let handles: Vec<_> = states
            .iter()
            .map(|state| {
                let state = state.clone();
                let shared = shared.clone();
                let script_env = script_env.clone();
                let tx = tx.clone();
                let entry_point = entry_point.as_str();
                let filter = &filter;
                scope.spawn(move || -> anyhow::Result<()> {
                    let cancel = shared.cancel.clone();
                    cancel::scope(&cancel, || {
                        load_state(&state, &script_env, entry_point)?;
                        for reg in state.registry.checks() {
                            if !filter.matches(&reg.check) {
                                continue;
                            }
                            let job = check_job(state.clone(), shared.clone(), reg);
                            if tx.send(Some(job)).is_err() {
                                break;
                            }
                        }
                        Ok(())
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().expect("phase-1 thread panicked").err())
            .collect()
    });

    if let Some(err) = load_errors.first() {
        shared.cancel.cancel(format!("{err:#}"));
    }

    // All phase-1 threads are done; the sentinel shuts the pool down.
    let _ = tx.send(None);
    drop(tx);
    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    if let Some(err) = load_errors.into_iter().next() {
        return Err(err);
    }
    if let Some(failure) = shared.failure.lock().unwrap().take() {
        return Err(failure);
    }
    if shared.cancel.is_cancelled() {
        let cause = shared.cancel.cause().unwrap_or_else(|| "run cancelled".into());
        return Err(cancel::Cancelled(cause).into());
    }
    if shared.error_seen.load(Ordering::SeqCst) {
        return Err(CheckFailedError.into());
    }
    Ok(())
}

/// Phase 1 for one state: load the entry point and validate that it did
/// something.
fn load_state(
    state: &Arc<EngineState>,
    script_env: &ScriptEnv,
    entry_point: &str,
) -> anyhow::Result<()> {
    let entry = if state.subdir.is_empty() {
        entry_point.to_string()
    } else {
        format!("{}/{entry_point}", state.subdir)
    };
    let key = SourceKey::main(&entry)?;
    let result = script_env.load(&key, state.as_ref());
    state.registry.freeze();
    if let Err(err) = result {
        return Err(anyhow!("{}\n{}", err.message, err.backtrace().trim_end()));
    }
    if state.registry.is_empty() && !state.printed.load(Ordering::SeqCst) {
        bail!("{key}: did you forget to call shac.register_check?");
    }
    Ok(())
}

/// Build the phase-2 closure for one check.
fn check_job(state: Arc<EngineState>, shared: Arc<Shared>, reg: Arc<RegisteredCheck>) -> Job {
    Box::new(move || {
        let started = Instant::now();
        let check_ctx = CheckCtx {
            scm: state.scm.clone(),
            checkout_root: shared.checkout_root.clone(),
            tmp_root: state.tmp.clone(),
            doc: shared.doc.clone(),
            sandbox: shared.sandbox.clone(),
            vars: shared.vars.clone(),
            report: shared.report.clone(),
            reg: reg.clone(),
            registry: state.registry.clone(),
            tempfile_seq: Default::default(),
        };
        let mut result = (reg.check.callable.func)(&check_ctx, &reg.check.args);
        // Outstanding subprocesses are a check bug even on success.
        let sweep = reg.sweep_subprocesses();
        if result.is_ok()
            && let Err(err) = sweep
        {
            result = Err(err.context("ctx.os.exec"));
        }

        match result {
            Ok(()) => {
                shared
                    .report
                    .check_completed(reg.name(), started.elapsed(), reg.highest_level(), None);
                if reg.highest_level() == Level::Error {
                    shared.error_seen.store(true, Ordering::SeqCst);
                }
            }
            Err(err) => {
                if shared.cancel.is_cancelled() && cancel::is_cancelled(&err) {
                    // Collateral of the cancellation; the cause is already
                    // on its way to the caller.
                    return;
                }
                let named = anyhow!("check {:?} failed: {err:#}", reg.name());
                shared.report.check_completed(
                    reg.name(),
                    started.elapsed(),
                    reg.highest_level(),
                    Some(&named),
                );
                let mut failure = shared.failure.lock().unwrap();
                if failure.is_none() {
                    shared.cancel.cancel(format!("{named:#}"));
                    *failure = Some(named);
                }
            }
        }
    })
}

/// Resolve declared variables to their effective values.
fn resolve_vars(
    doc: &Document,
    overrides: HashMap<String, String>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut vars: HashMap<String, String> = doc
        .vars
        .iter()
        .map(|v| (v.name.clone(), v.default.clone()))
        .collect();
    for (name, value) in overrides {
        if !vars.contains_key(&name) {
            bail!("unknown variable {name:?}");
        }
        vars.insert(name, value);
    }
    Ok(vars)
}

/// The subdirectories to run: `[""]` normally, every directory containing
/// the entry-point file when recursing.
fn discover_entry_points(
    scm: &Arc<dyn Scm>,
    root: &std::path::Path,
    entry_point: &str,
    recurse: bool,
) -> anyhow::Result<Vec<String>> {
    if !recurse {
        if !root.join(entry_point).is_file() {
            bail!("no {entry_point} in {}", root.display());
        }
        return Ok(vec![String::new()]);
    }
    let mut subdirs: Vec<String> = scm
        .all_files(false)?
        .iter()
        .filter_map(|f| {
            let path = f.path();
            match path.rsplit_once('/') {
                Some((dir, base)) if base == entry_point => Some(dir.to_string()),
                None if path == entry_point => Some(String::new()),
                _ => None,
            }
        })
        .collect();
    subdirs.sort();
    subdirs.dedup();
    if subdirs.is_empty() {
        bail!("no {entry_point} found under {}", root.display());
    }
    Ok(subdirs)
}

/// Collects findings during a run, on top of forwarding to an inner
/// reporter.
struct FindingTee {
    inner: Arc<dyn Report>,
    findings: Mutex<Vec<Finding>>,
}

impl Report for FindingTee {
    fn finding(&self, check: &str, finding: &Finding) -> anyhow::Result<()> {
        self.findings.lock().unwrap().push(finding.clone());
        self.inner.finding(check, finding)
    }

    fn artifact(
        &self,
        check: &str,
        root: Option<&std::path::Path>,
        file: &str,
        content: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        self.inner.artifact(check, root, file, content)
    }

    fn check_completed(
        &self,
        check: &str,
        duration: std::time::Duration,
        level: Level,
        err: Option<&anyhow::Error>,
    ) {
        self.inner.check_completed(check, duration, level, err);
    }

    fn print(&self, file: &str, line: u32, message: &str) {
        self.inner.print(file, line, message);
    }
}

/// The separate fix mode: run the checks, then apply every finding with
/// exactly one replacement back to the files on disk. Returns the number of
/// findings applied.
///
/// Error-level findings don't abort a fix run — they are what fixes come
/// from — but abnormal check failures still do.
pub fn fix(mut options: RunOptions) -> anyhow::Result<usize> {
    let root = dunce::canonicalize(&options.root)
        .with_context(|| format!("failed to resolve root {}", options.root.display()))?;
    let tee = Arc::new(FindingTee {
        inner: options.report,
        findings: Mutex::new(Vec::new()),
    });
    options.report = tee.clone();
    match run(options) {
        Ok(()) => {}
        Err(err) if is_check_failure(&err) => {}
        Err(err) => return Err(err),
    }
    let findings = std::mem::take(&mut *tee.findings.lock().unwrap());
    crate::fixer::apply(&root, &findings)
}
