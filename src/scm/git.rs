//! Git checkout backend.
//!
//! Listings and per-line diffs are computed against an "upstream" baseline:
//! `@{u}` when the branch has one, otherwise `HEAD~1` when the worktree is
//! pristine (ignoring untracked files), otherwise `HEAD`. "No upstream" and
//! "not a branch" conditions are recovered into the fallback; any other git
//! failure is terminal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};

use super::cmd::{git, git_output};
use super::{Action, FileList, NumberedLine, Scm, ScmFile, whole_file_lines};
use crate::cancel;

#[derive(Default)]
struct Caches {
    affected: HashMap<bool, FileList>,
    all: HashMap<bool, FileList>,
}

/// An SCM view of a git checkout.
pub struct GitCheckout {
    root: PathBuf,
    head: String,
    /// Symbolic name of HEAD; `"HEAD"` when detached.
    branch: String,
    /// The resolved baseline everything is diffed against.
    upstream: String,
    /// When set, `new_lines` returns whole files instead of diffs.
    all_files_mode: bool,
    caches: Mutex<Caches>,
}

impl GitCheckout {
    /// Discover the checkout containing `dir` and resolve the upstream
    /// baseline. Fails if `dir` is not inside a git worktree with at least
    /// one commit.
    pub fn new(dir: &Path, all_files_mode: bool) -> anyhow::Result<GitCheckout> {
        let top = git(dir, &["rev-parse", "--show-toplevel"])?;
        let root = dunce::canonicalize(top.trim())
            .with_context(|| format!("failed to canonicalize {}", top.trim()))?;
        let head = git(&root, &["rev-parse", "HEAD"])?.trim().to_string();
        let branch = git(&root, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string();
        let upstream = resolve_upstream(&root)?;
        Ok(GitCheckout {
            root,
            head,
            branch,
            upstream,
            all_files_mode,
            caches: Mutex::new(Caches::default()),
        })
    }

    /// Full hash of HEAD, exposed to scripts as `shac.commit_hash`.
    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    fn load_affected(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        let stdout = git(
            &self.root,
            &["diff", "--name-status", "-z", "-C", &self.upstream],
        )?;
        let mut files = Vec::new();
        for (action, path) in parse_name_status(&stdout)? {
            if !include_deleted && action == Action::Deleted {
                continue;
            }
            // Submodules show up as directories on disk; they are not files
            // the checks can read, so drop them unless deleted.
            if action != Action::Deleted && self.root.join(&path).is_dir() {
                continue;
            }
            files.push(Arc::new(ScmFile::new(path, action)));
        }
        files.sort_by(|a, b| a.path().cmp(b.path()));
        files.dedup_by(|a, b| a.path() == b.path());
        Ok(Arc::new(files))
    }

    fn load_all(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        let stdout = git(&self.root, &["ls-files", "-z"])?;
        let mut files = Vec::new();
        for path in stdout.split('\0').filter(|p| !p.is_empty()) {
            let on_disk = self.root.join(path);
            let action = match on_disk.metadata() {
                Ok(meta) if meta.is_dir() => continue, // submodule
                Ok(_) => Action::Untracked,
                Err(_) => Action::Deleted,
            };
            if action == Action::Deleted && !include_deleted {
                continue;
            }
            files.push(Arc::new(ScmFile::new(path, action)));
        }
        files.sort_by(|a, b| a.path().cmp(b.path()));
        files.dedup_by(|a, b| a.path() == b.path());
        Ok(Arc::new(files))
    }
}

impl Scm for GitCheckout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn affected_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        cancel::current().check()?;
        let mut caches = self.caches.lock().unwrap();
        if let Some(cached) = caches.affected.get(&include_deleted) {
            return Ok(cached.clone());
        }
        let files = self.load_affected(include_deleted)?;
        caches.affected.insert(include_deleted, files.clone());
        Ok(files)
    }

    fn all_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        cancel::current().check()?;
        let mut caches = self.caches.lock().unwrap();
        if let Some(cached) = caches.all.get(&include_deleted) {
            return Ok(cached.clone());
        }
        let files = self.load_all(include_deleted)?;
        caches.all.insert(include_deleted, files.clone());
        Ok(files)
    }

    fn new_lines(&self, file: &ScmFile) -> anyhow::Result<Vec<NumberedLine>> {
        cancel::current().check()?;
        if file.is_deleted() {
            return Ok(Vec::new());
        }
        if self.all_files_mode {
            return whole_file_lines(&self.root.join(file.root_path()));
        }
        let stdout = git(
            &self.root,
            &[
                "diff",
                "--no-prefix",
                "-C",
                "-U0",
                "--no-ext-diff",
                "--irreversible-delete",
                &self.upstream,
                "--",
                file.root_path(),
            ],
        )?;
        if stdout.is_empty() {
            // No diff against the baseline; the whole file counts.
            return whole_file_lines(&self.root.join(file.root_path()));
        }
        Ok(parse_zero_context_hunks(&stdout))
    }
}

/// Resolve the baseline commit-ish per the fallback chain documented on
/// [`GitCheckout`].
fn resolve_upstream(root: &Path) -> anyhow::Result<String> {
    let out = git_output(
        root,
        &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
    )?;
    if out.success() {
        return Ok(out.stdout.trim().to_string());
    }
    let stderr = out.stderr.to_lowercase();
    if !stderr.contains("no upstream") && !stderr.contains("does not point to a branch") {
        bail!("failed to resolve upstream: {}", out.stderr.trim());
    }
    let pristine = git(root, &["status", "--porcelain", "--untracked-files=no"])?
        .trim()
        .is_empty();
    if pristine && git_output(root, &["rev-parse", "--verify", "-q", "HEAD~1"])?.success() {
        return Ok("HEAD~1".to_string());
    }
    Ok("HEAD".to_string())
}

/// Parse NUL-delimited `diff --name-status -z -C` output into
/// `(action, path)` pairs. Rename and copy records carry the source path
/// first; it is consumed and dropped, keeping the post-change path.
fn parse_name_status(data: &str) -> anyhow::Result<Vec<(Action, String)>> {
    let mut out = Vec::new();
    let mut parts = data.split('\0').filter(|s| !s.is_empty());
    while let Some(status) = parts.next() {
        let Some(action) = Action::from_status(status) else {
            bail!("unexpected diff status {status:?}");
        };
        let first = parts
            .next()
            .context("malformed diff output: status without path")?;
        let path = if matches!(action, Action::Renamed | Action::Copied) {
            parts
                .next()
                .context("malformed diff output: rename/copy without destination")?
        } else {
            first
        };
        out.push((action, path.to_string()));
    }
    Ok(out)
}

/// Extract added lines from `diff -U0` output.
///
/// Everything before the first hunk header is discarded (this covers the
/// `---`/`+++` file headers). Each `@@ -a,b +c,d @@` header seeds the line
/// counter at `c`; `+` lines emit and advance it, `-` lines and the "no
/// newline at end of file" marker are skipped. Binary diffs have no hunks
/// and yield nothing.
fn parse_zero_context_hunks(diff: &str) -> Vec<NumberedLine> {
    let mut out = Vec::new();
    let mut counter: Option<u32> = None;
    for line in diff.lines() {
        if line.starts_with("@@") {
            counter = parse_hunk_start(line);
            continue;
        }
        let Some(n) = counter.as_mut() else {
            continue; // still in the file header
        };
        if let Some(content) = line.strip_prefix('+') {
            out.push((*n, content.to_string()));
            *n += 1;
        }
        // '-' lines and '\ No newline at end of file' don't advance the
        // new-side counter.
    }
    out
}

/// Parse `c` out of `@@ -a,b +c,d @@`.
fn parse_hunk_start(header: &str) -> Option<u32> {
    let plus = header.split_whitespace().find(|tok| tok.starts_with('+'))?;
    let digits = &plus[1..];
    let start = digits.split(',').next()?;
    start.parse().ok()
}
