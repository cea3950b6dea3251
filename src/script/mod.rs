//! Script loading: source references, the memoizing loader, and the
//! evaluator boundary.
//!
//! The scripting language is an external collaborator. The engine hands an
//! [`Evaluator`] the source text plus a [`LoadHost`] for its builtin needs
//! (loading other sources, registering checks, printing), and memoizes the
//! resulting exports per cleaned source reference.
//!
//! Memoization is concurrent-safe: the first requester of a reference
//! atomically creates a slot, takes the slot's own lock, releases the map
//! lock, and evaluates. Later requesters from other threads block on the
//! slot until the exports (or error) land. A later requester from the *same*
//! thread tries a non-blocking acquire — failure means the file is still
//! being evaluated further up its own call stack, which is a dependency
//! cycle. This gives at-most-one evaluation per source and deadlock-free
//! cycle detection without auxiliary bookkeeping.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, ThreadId};

use anyhow::bail;

use crate::check::Check;
use crate::pkg::{MAIN_PKG, PackageSet};

/// Frozen exports of one evaluated script file, shared by every loader of
/// the same reference. The concrete type belongs to the evaluator.
pub type Exports = Arc<dyn Any + Send + Sync>;

pub type LoadResult = Result<Exports, EvalError>;

/// One frame of a script backtrace, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Canonical source reference, e.g. `//checks/lint.star`.
    pub source: String,
    /// 1-based; 0 when unknown.
    pub line: u32,
    pub col: u32,
    pub func: String,
}

/// An error raised during script evaluation, carrying the script-level call
/// stack. The loader guarantees reporters always see at least one frame.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    pub frames: Vec<Frame>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> EvalError {
        EvalError {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Render the backtrace the way reporters print it.
    pub fn backtrace(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            if frame.line == 0 {
                out.push_str(&format!("  {}: in {}\n", frame.source, frame.func));
            } else {
                out.push_str(&format!(
                    "  {}:{}:{}: in {}\n",
                    frame.source, frame.line, frame.col, frame.func
                ));
            }
        }
        out
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Builtin surface available while a file loads.
pub trait LoadHost {
    /// Load another source, relative to the current file. Routed through
    /// the memoizing loader.
    fn load(&self, reference: &str) -> LoadResult;
    /// Register a check. Fails once loading completes.
    fn register_check(&self, check: Check) -> anyhow::Result<()>;
    /// `print()` from script code; `file`/`line` locate the call site.
    fn print(&self, file: &str, line: u32, message: &str);
    /// Engine version, exposed as `shac.version`.
    fn version(&self) -> (u32, u32, u32);
    /// HEAD hash when the SCM is a git checkout, as `shac.commit_hash`.
    fn commit_hash(&self) -> Option<&str>;
}

/// The embedded scripting-language evaluator. A black box to the engine.
pub trait Evaluator: Send + Sync {
    /// Evaluate `code` and return the file's exports. Builtins called
    /// during evaluation go through `host`; a recursive `host.load` may
    /// re-enter the loader on the same thread.
    fn eval(&self, key: &SourceKey, code: &str, host: &dyn LoadHost) -> LoadResult;
}

/// Registration and print sink for one engine state. Load is shared across
/// states; registration is not.
pub trait LoadSink: Sync {
    fn register_check(&self, check: Check) -> anyhow::Result<()>;
    fn print(&self, file: &str, line: u32, message: &str);
}

/// A resolved source reference: package name plus cleaned relative path.
///
/// Two references resolving to the same `(pkg, path)` are the same source,
/// whatever they looked like in script code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub pkg: String,
    pub path: String,
}

impl SourceKey {
    /// A key inside `__main__`, for entry points.
    pub fn main(path: &str) -> anyhow::Result<SourceKey> {
        Ok(SourceKey {
            pkg: MAIN_PKG.to_string(),
            path: clean_path(path)?,
        })
    }

    /// Resolve a script-side reference against the file it appears in.
    ///
    /// Forms: `//path` (root of the current package), `./rel` and `../rel`
    /// (relative to the referrer), `@pkg` (the package's root entry file,
    /// `root_file`), `@pkg//path`. External references must not contain
    /// `..`, empty segments, or a path segment named `internal`.
    pub fn resolve(
        referrer: &SourceKey,
        reference: &str,
        root_file: &str,
    ) -> anyhow::Result<SourceKey> {
        if let Some(rest) = reference.strip_prefix("//") {
            return Ok(SourceKey {
                pkg: referrer.pkg.clone(),
                path: clean_path(rest)?,
            });
        }
        if let Some(rest) = reference.strip_prefix('@') {
            let (pkg, path) = match rest.split_once("//") {
                Some((pkg, path)) => (pkg, path),
                None => (rest, root_file),
            };
            if pkg.is_empty() {
                bail!("reference {reference:?} has an empty package name");
            }
            validate_external_path(reference, path)?;
            return Ok(SourceKey {
                pkg: pkg.to_string(),
                path: clean_path(path)?,
            });
        }
        if reference.starts_with("./") || reference.starts_with("../") {
            let base = match referrer.path.rsplit_once('/') {
                Some((dir, _)) => format!("{dir}/{reference}"),
                None => reference.to_string(),
            };
            let Ok(path) = clean_path(&base) else {
                bail!("reference {reference:?} escapes the package root");
            };
            return Ok(SourceKey {
                pkg: referrer.pkg.clone(),
                path,
            });
        }
        bail!("reference {reference:?} must start with //, ./, ../ or @");
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pkg == MAIN_PKG {
            write!(f, "//{}", self.path)
        } else {
            write!(f, "@{}//{}", self.pkg, self.path)
        }
    }
}

/// Normalize a `/`-separated relative path, rejecting empty segments and
/// `..` escaping the root.
fn clean_path(path: &str) -> anyhow::Result<String> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => bail!("path {path:?} has an empty segment"),
            "." => {}
            ".." => {
                if out.pop().is_none() {
                    bail!("path {path:?} escapes the package root");
                }
            }
            _ => out.push(segment),
        }
    }
    if out.is_empty() {
        bail!("path {path:?} is empty");
    }
    Ok(out.join("/"))
}

fn validate_external_path(reference: &str, path: &str) -> anyhow::Result<()> {
    for segment in path.split('/') {
        match segment {
            "" => bail!("reference {reference:?} has an empty path segment"),
            ".." => bail!("reference {reference:?} must not contain \"..\""),
            "internal" => {
                bail!("reference {reference:?} crosses into an internal directory")
            }
            _ => {}
        }
    }
    Ok(())
}

struct Slot {
    owner: ThreadId,
    state: Mutex<Option<LoadResult>>,
}

/// The script environment: one per run, shared by every engine state.
pub struct ScriptEnv {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    packages: Arc<PackageSet>,
    evaluator: Arc<dyn Evaluator>,
    /// Default root file of an external package, the run's entry-point
    /// basename.
    root_file: String,
    version: (u32, u32, u32),
    commit_hash: Option<String>,
}

impl ScriptEnv {
    pub fn new(
        packages: Arc<PackageSet>,
        evaluator: Arc<dyn Evaluator>,
        root_file: impl Into<String>,
        commit_hash: Option<String>,
    ) -> ScriptEnv {
        ScriptEnv {
            slots: Mutex::new(HashMap::new()),
            packages,
            evaluator,
            root_file: root_file.into(),
            version: crate::version(),
            commit_hash,
        }
    }

    /// Load a source, evaluating it at most once process-wide.
    pub fn load(&self, key: &SourceKey, sink: &dyn LoadSink) -> LoadResult {
        let keystr = key.to_string();
        let me = thread::current().id();

        let slot: Arc<Slot>;
        let owned_guard: Option<MutexGuard<'_, Option<LoadResult>>>;
        {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(&keystr) {
                Some(existing) => {
                    slot = existing.clone();
                    owned_guard = None;
                }
                None => {
                    slot = Arc::new(Slot {
                        owner: me,
                        state: Mutex::new(None),
                    });
                    slots.insert(keystr.clone(), slot.clone());
                    // Taken while the map lock is still held, so no other
                    // requester can observe the slot before we own it.
                    owned_guard = Some(slot.state.lock().unwrap());
                }
            }
        }

        if let Some(mut guard) = owned_guard {
            let result = self.evaluate(key, sink);
            *guard = Some(result.clone());
            return result;
        }

        if slot.owner == me {
            // Same thread: if the evaluation finished long ago this
            // succeeds and serves the memoized result; if the slot is still
            // held further up our own call stack, this is a cycle.
            return match slot.state.try_lock() {
                Ok(guard) => finished(guard),
                Err(TryLockError::WouldBlock) => {
                    Err(EvalError::new(format!("cycle dependency graph: {keystr}")))
                }
                Err(TryLockError::Poisoned(poisoned)) => finished(poisoned.into_inner()),
            };
        }

        // Different thread: wait for the owner to finish.
        match slot.state.lock() {
            Ok(guard) => finished(guard),
            Err(poisoned) => finished(poisoned.into_inner()),
        }
    }

    fn evaluate(&self, key: &SourceKey, sink: &dyn LoadSink) -> LoadResult {
        let Some(root) = self.packages.root_of(&key.pkg) else {
            return Err(self.at_toplevel(
                key,
                EvalError::new(format!("unknown package \"@{}\"", key.pkg)),
            ));
        };
        let path = root.join(&key.path);
        let code = match std::fs::read_to_string(&path) {
            Ok(code) => code,
            Err(err) => {
                return Err(self.at_toplevel(
                    key,
                    EvalError::new(format!("failed to read {key}: {err}")),
                ));
            }
        };
        let host = Host {
            env: self,
            key: key.clone(),
            sink,
        };
        match self.evaluator.eval(key, &code, &host) {
            Ok(exports) => Ok(exports),
            Err(mut err) => {
                // Drop the evaluator's trailing builtin frame; it locates
                // engine code, not script code.
                if err.frames.last().is_some_and(|f| f.func == "<builtin>") {
                    err.frames.pop();
                }
                Err(self.at_toplevel(key, err))
            }
        }
    }

    /// Guarantee a backtrace by appending a synthetic top-level frame when
    /// the evaluator produced none.
    fn at_toplevel(&self, key: &SourceKey, mut err: EvalError) -> EvalError {
        if err.frames.is_empty() {
            err.frames.push(Frame {
                source: key.to_string(),
                line: 0,
                col: 0,
                func: "<toplevel>".to_string(),
            });
        }
        err
    }
}

fn finished(guard: MutexGuard<'_, Option<LoadResult>>) -> LoadResult {
    match guard.as_ref() {
        Some(result) => result.clone(),
        // Only reachable if the owner panicked mid-evaluation.
        None => Err(EvalError::new("script evaluation panicked")),
    }
}

struct Host<'a> {
    env: &'a ScriptEnv,
    key: SourceKey,
    sink: &'a dyn LoadSink,
}

impl LoadHost for Host<'_> {
    fn load(&self, reference: &str) -> LoadResult {
        let resolved = match SourceKey::resolve(&self.key, reference, &self.env.root_file) {
            Ok(key) => key,
            Err(err) => return Err(EvalError::new(err.to_string())),
        };
        self.env.load(&resolved, self.sink)
    }

    fn register_check(&self, check: Check) -> anyhow::Result<()> {
        self.sink.register_check(check)
    }

    fn print(&self, file: &str, line: u32, message: &str) {
        self.sink.print(file, line, message);
    }

    fn version(&self) -> (u32, u32, u32) {
        self.env.version
    }

    fn commit_hash(&self) -> Option<&str> {
        self.env.commit_hash.as_deref()
    }
}
