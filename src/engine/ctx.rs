//! The per-check `ctx` value.
//!
//! Everything a check callback can reach lives here, namespaced the way
//! scripts see it: `ctx.io`, `ctx.re`, `ctx.scm`, `ctx.os`, `ctx.emit`,
//! `ctx.vars`. Builtin errors are prefixed with the builtin's dotted name
//! exactly once; blocking builtins consult the ambient cancellation token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, bail};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cancel;
use crate::check::{Check, CheckRegistry, RegisteredCheck};
use crate::doc::Document;
use crate::exec::{CompletedSubprocess, ExecContext, ExecRequest, Subprocess};
use crate::finding::{Finding, Level, Span};
use crate::report::Report;
use crate::sandbox::Sandbox;
use crate::scm::{NumberedLine, Scm, ScmFile};

/// Hard cap for `ctx.io.read_file` with `size=0`.
const MAX_READ: u64 = 1 << 30;

/// Process-wide compiled-pattern cache; patterns recur across checks.
static RE_CACHE: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

/// The value passed to every check callback.
pub struct CheckCtx {
    pub(crate) scm: Arc<dyn Scm>,
    pub(crate) checkout_root: PathBuf,
    pub(crate) tmp_root: PathBuf,
    pub(crate) doc: Arc<Document>,
    pub(crate) sandbox: Arc<dyn Sandbox>,
    pub(crate) vars: Arc<HashMap<String, String>>,
    pub(crate) report: Arc<dyn Report>,
    pub(crate) reg: Arc<RegisteredCheck>,
    pub(crate) registry: Arc<CheckRegistry>,
    pub(crate) tempfile_seq: AtomicU32,
}

/// Prefix a builtin error with its dotted name, once.
fn builtin_err(name: &str, err: anyhow::Error) -> anyhow::Error {
    if crate::cancel::is_cancelled(&err) {
        return err;
    }
    anyhow!("{name}: {err:#}")
}

impl CheckCtx {
    pub fn check_name(&self) -> &str {
        self.reg.name()
    }

    pub fn io(&self) -> IoApi<'_> {
        IoApi(self)
    }

    pub fn re(&self) -> ReApi<'_> {
        ReApi(self)
    }

    pub fn scm(&self) -> ScmApi<'_> {
        ScmApi(self)
    }

    pub fn os(&self) -> OsApi<'_> {
        OsApi(self)
    }

    pub fn emit(&self) -> EmitApi<'_> {
        EmitApi(self)
    }

    pub fn vars(&self) -> VarsApi<'_> {
        VarsApi(self)
    }

    /// `ctx.platform.os` / `ctx.os.name`.
    pub fn platform_os(&self) -> &'static str {
        std::env::consts::OS
    }

    /// `shac.register_check` resolved from inside a check body. Routed to
    /// the owning state's registry, which froze when loading completed, so
    /// this always reports the registration error.
    pub fn register_check(&self, check: Check) -> anyhow::Result<()> {
        self.registry.register(check)
    }

    /// Script-side `print()` from inside a check body.
    pub fn print(&self, file: &str, line: u32, message: &str) {
        self.report.print(file, line, message);
    }

    /// The directory this check's relative paths resolve under.
    fn view_root(&self) -> &Path {
        self.scm.root()
    }

    /// Validate a script-supplied relative path and resolve it under the
    /// check's root.
    fn resolve_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.is_empty() {
            bail!("filepath must not be empty");
        }
        if Path::new(path).is_absolute() {
            bail!("filepath must be relative, got {path:?}");
        }
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        bail!("filepath must stay under the root, got {path:?}");
                    }
                }
                _ => segments.push(segment),
            }
        }
        Ok(self.view_root().join(segments.join("/")))
    }
}

pub struct IoApi<'a>(&'a CheckCtx);

impl IoApi<'_> {
    /// `ctx.io.read_file(filepath, size=0)`. `size=0` reads the whole file
    /// (up to a platform cap); otherwise at most `size` bytes.
    pub fn read_file(&self, path: &str, size: u64) -> anyhow::Result<Vec<u8>> {
        self.read_file_inner(path, size)
            .map_err(|e| builtin_err("ctx.io.read_file", e))
    }

    fn read_file_inner(&self, path: &str, size: u64) -> anyhow::Result<Vec<u8>> {
        use std::io::Read as _;
        cancel::current().check()?;
        let full = self.0.resolve_path(path)?;
        let meta = std::fs::metadata(&full).map_err(|e| anyhow!("{path}: {e}"))?;
        if meta.is_dir() {
            bail!("{path} is a directory");
        }
        let limit = if size == 0 { MAX_READ } else { size.min(MAX_READ) };
        let file = std::fs::File::open(&full).map_err(|e| anyhow!("{path}: {e}"))?;
        let mut buf = Vec::with_capacity(meta.len().min(limit) as usize);
        file.take(limit).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// `ctx.io.tempdir()`: a fresh directory under the check's temp root.
    pub fn tempdir(&self) -> anyhow::Result<PathBuf> {
        self.tempdir_inner()
            .map_err(|e| builtin_err("ctx.io.tempdir", e))
    }

    fn tempdir_inner(&self) -> anyhow::Result<PathBuf> {
        let seq = self.0.tempfile_seq.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .0
            .tmp_root
            .join(format!("{}-{seq}", self.0.check_name()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// `ctx.io.tempfile(content, name="tempfile")`: write `content` into a
    /// fresh temp directory and return the file path.
    pub fn tempfile(&self, content: &[u8], name: Option<&str>) -> anyhow::Result<PathBuf> {
        let result = (|| {
            let name = name.unwrap_or("tempfile");
            if name.contains('/') || name.contains('\\') {
                bail!("name must not contain a path separator, got {name:?}");
            }
            let path = self.tempdir_inner()?.join(name);
            std::fs::write(&path, content)?;
            Ok(path)
        })();
        result.map_err(|e| builtin_err("ctx.io.tempfile", e))
    }
}

/// One regex match: byte offsets of the whole match plus captured groups,
/// index 0 being the whole match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReMatch {
    pub offset: (usize, usize),
    pub groups: Vec<Option<String>>,
}

pub struct ReApi<'a>(&'a CheckCtx);

impl ReApi<'_> {
    /// `ctx.re.match(pattern, str)`: first match, if any.
    pub fn match_first(&self, pattern: &str, haystack: &str) -> anyhow::Result<Option<ReMatch>> {
        let re = compiled(pattern).map_err(|e| builtin_err("ctx.re.match", e))?;
        Ok(re.captures(haystack).map(|c| to_match(&c)))
    }

    /// `ctx.re.allmatches(pattern, str)`: every non-overlapping match.
    pub fn allmatches(&self, pattern: &str, haystack: &str) -> anyhow::Result<Vec<ReMatch>> {
        let re = compiled(pattern).map_err(|e| builtin_err("ctx.re.allmatches", e))?;
        Ok(re.captures_iter(haystack).map(|c| to_match(&c)).collect())
    }
}

fn compiled(pattern: &str) -> anyhow::Result<Arc<Regex>> {
    if let Some(re) = RE_CACHE.get(pattern) {
        return Ok(re.clone());
    }
    let re = Arc::new(Regex::new(pattern).map_err(|e| anyhow!("invalid pattern: {e}"))?);
    RE_CACHE.insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn to_match(captures: &regex::Captures<'_>) -> ReMatch {
    let whole = captures.get(0).expect("group 0 always matches");
    ReMatch {
        offset: (whole.start(), whole.end()),
        groups: captures
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect(),
    }
}

/// A file handed to script code: the SCM entry plus the view it came from,
/// so `new_lines()` works without threading the SCM through the script.
#[derive(Clone)]
pub struct CtxFile {
    file: Arc<ScmFile>,
    scm: Arc<dyn Scm>,
}

impl CtxFile {
    pub fn path(&self) -> &str {
        self.file.path()
    }

    /// The status code letter; empty for untracked / raw-tree files.
    pub fn action(&self) -> &'static str {
        self.file.action().code()
    }

    pub fn new_lines(&self) -> anyhow::Result<Vec<NumberedLine>> {
        self.scm
            .new_lines(&self.file)
            .map_err(|e| builtin_err("file.new_lines", e))
    }
}

pub struct ScmApi<'a>(&'a CheckCtx);

impl ScmApi<'_> {
    /// `ctx.scm.root`: absolute path of the check's view.
    pub fn root(&self) -> String {
        self.0.view_root().to_string_lossy().into_owned()
    }

    /// `ctx.scm.affected_files(include_deleted=False)`.
    pub fn affected_files(&self, include_deleted: bool) -> anyhow::Result<Vec<CtxFile>> {
        let files = self
            .0
            .scm
            .affected_files(include_deleted)
            .map_err(|e| builtin_err("ctx.scm.affected_files", e))?;
        Ok(self.wrap(&files))
    }

    /// `ctx.scm.all_files(include_deleted=False)`.
    pub fn all_files(&self, include_deleted: bool) -> anyhow::Result<Vec<CtxFile>> {
        let files = self
            .0
            .scm
            .all_files(include_deleted)
            .map_err(|e| builtin_err("ctx.scm.all_files", e))?;
        Ok(self.wrap(&files))
    }

    fn wrap(&self, files: &crate::scm::FileList) -> Vec<CtxFile> {
        files
            .iter()
            .map(|file| CtxFile {
                file: file.clone(),
                scm: self.0.scm.clone(),
            })
            .collect()
    }
}

/// Handle returned by `ctx.os.exec`; owned by the check that created it.
pub struct SubprocessHandle {
    inner: Arc<Subprocess>,
}

impl SubprocessHandle {
    /// `.wait()`: at most once.
    pub fn wait(&self) -> anyhow::Result<CompletedSubprocess> {
        self.inner
            .wait()
            .map_err(|e| builtin_err("ctx.os.exec", e))
    }
}

pub struct OsApi<'a>(&'a CheckCtx);

impl OsApi<'_> {
    /// `ctx.os.exec(cmd, ...)`: start a sandboxed subprocess.
    pub fn exec(&self, req: ExecRequest) -> anyhow::Result<SubprocessHandle> {
        let exec_ctx = ExecContext {
            checkout_root: &self.0.checkout_root,
            view_root: self.0.view_root(),
            tmp_root: &self.0.tmp_root,
            doc: &self.0.doc,
            sandbox: self.0.sandbox.clone(),
        };
        let subprocess =
            crate::exec::start(&exec_ctx, req).map_err(|e| builtin_err("ctx.os.exec", e))?;
        self.0.reg.track_subprocess(subprocess.clone());
        Ok(SubprocessHandle { inner: subprocess })
    }

    /// `ctx.os.name`.
    pub fn name(&self) -> &'static str {
        self.0.platform_os()
    }
}

pub struct EmitApi<'a>(&'a CheckCtx);

impl EmitApi<'_> {
    /// `ctx.emit.finding(level, message, filepath?, span?, replacements?)`.
    ///
    /// The span's end column is exclusive; a zero-width span addresses an
    /// insertion point.
    pub fn finding(
        &self,
        level: Level,
        message: &str,
        filepath: Option<&str>,
        span: Span,
        replacements: Vec<String>,
    ) -> anyhow::Result<()> {
        let result = (|| {
            if let Some(path) = filepath {
                self.0.resolve_path(path)?;
            }
            let finding = Finding {
                check: self.0.check_name().to_string(),
                level,
                message: message.to_string(),
                file: filepath.map(String::from),
                span,
                replacements,
            };
            finding.validate()?;
            self.0.report.finding(self.0.check_name(), &finding)?;
            self.0.reg.record_level(level);
            Ok(())
        })();
        result.map_err(|e| builtin_err("ctx.emit.finding", e))
    }

    /// `ctx.emit.artifact(filepath, content=None)`: inline bytes, or read
    /// from disk when `content` is omitted.
    pub fn artifact(&self, filepath: &str, content: Option<&[u8]>) -> anyhow::Result<()> {
        let result = (|| match content {
            Some(bytes) => self
                .0
                .report
                .artifact(self.0.check_name(), None, filepath, Some(bytes)),
            None => {
                let full = self.0.resolve_path(filepath)?;
                if !full.is_file() {
                    bail!("{filepath}: no such file");
                }
                self.0
                    .report
                    .artifact(self.0.check_name(), Some(self.0.view_root()), filepath, None)
            }
        })();
        result.map_err(|e| builtin_err("ctx.emit.artifact", e))
    }
}

pub struct VarsApi<'a>(&'a CheckCtx);

impl VarsApi<'_> {
    /// `ctx.vars.get(name)`: a declared variable's effective value.
    pub fn get(&self, name: &str) -> anyhow::Result<String> {
        let result = (|| {
            cancel::current().check()?;
            match self.0.vars.get(name) {
                Some(value) => Ok(value.clone()),
                None => bail!("unknown variable {name:?}"),
            }
        })();
        result.map_err(|e| builtin_err("ctx.vars.get", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{Check, CheckCallable, KwArgs, Param};
    use crate::report::NoopReport;
    use crate::sandbox::Passthrough;
    use crate::scm::RawTree;

    fn test_ctx(root: &Path) -> CheckCtx {
        let scm: Arc<dyn Scm> = Arc::new(RawTree::new(root).unwrap());
        let callable = CheckCallable {
            name: "cb".into(),
            params: vec![Param::required("ctx")],
            has_varargs: false,
            has_kwargs: false,
            builtin: false,
            func: Arc::new(|_, _| Ok(())),
        };
        let check = Check::new(callable, None, false, KwArgs::new()).unwrap();
        let registry = Arc::new(CheckRegistry::new());
        registry.register(check).unwrap();
        let reg = registry.checks().pop().unwrap();
        let mut vars = HashMap::new();
        vars.insert("profile".to_string(), "debug".to_string());
        CheckCtx {
            checkout_root: scm.root().to_path_buf(),
            scm,
            tmp_root: root.join(".tmp"),
            doc: Arc::new(Document::default()),
            sandbox: Arc::new(Passthrough),
            vars: Arc::new(vars),
            report: Arc::new(NoopReport),
            reg,
            registry,
            tempfile_seq: AtomicU32::new(0),
        }
    }

    fn fixture() -> (tempfile::TempDir, CheckCtx) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        let ctx = test_ctx(dir.path());
        (dir, ctx)
    }

    #[test]
    fn read_file_full_and_capped() {
        let (_dir, ctx) = fixture();
        assert_eq!(ctx.io().read_file("a.txt", 0).unwrap(), b"hello world\n");
        assert_eq!(ctx.io().read_file("a.txt", 5).unwrap(), b"hello");
        assert_eq!(ctx.io().read_file("a.txt", 4096).unwrap(), b"hello world\n");
    }

    #[test]
    fn read_file_rejects_directories_and_escapes() {
        let (_dir, ctx) = fixture();
        let err = ctx.io().read_file(".tmp", 0).unwrap_err();
        assert!(format!("{err:#}").starts_with("ctx.io.read_file:"));
        assert!(format!("{err:#}").contains("directory"));
        assert!(ctx.io().read_file("../outside.txt", 0).is_err());
        assert!(ctx.io().read_file("/etc/passwd", 0).is_err());
        // Stepping down then up stays legal.
        assert!(ctx.io().read_file("sub/../a.txt", 0).is_ok());
    }

    #[test]
    fn tempfile_and_tempdir_nest_under_the_state_root() {
        let (dir, ctx) = fixture();
        let tmp = ctx.io().tempdir().unwrap();
        assert!(tmp.starts_with(dir.path().join(".tmp")));
        let file = ctx.io().tempfile(b"content", Some("input.txt")).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"content");
        assert!(file.ends_with("input.txt"));
        assert!(ctx.io().tempfile(b"x", Some("a/b")).is_err());
    }

    #[test]
    fn regex_match_and_allmatches() {
        let (_dir, ctx) = fixture();
        let m = ctx
            .re()
            .match_first(r"(w\w+)", "hello world")
            .unwrap()
            .unwrap();
        assert_eq!(m.offset, (6, 11));
        assert_eq!(m.groups[1].as_deref(), Some("world"));
        assert!(ctx.re().match_first("xyz", "hello").unwrap().is_none());

        let all = ctx.re().allmatches(r"l+", "hello world").unwrap();
        assert_eq!(all.len(), 2);

        let err = ctx.re().match_first("(unclosed", "x").unwrap_err();
        assert!(format!("{err:#}").starts_with("ctx.re.match:"));
    }

    #[test]
    fn emit_finding_records_highest_level() {
        let (_dir, ctx) = fixture();
        ctx.emit()
            .finding(Level::Warning, "warn", Some("a.txt"), Span::default(), vec![])
            .unwrap();
        assert_eq!(ctx.reg.highest_level(), Level::Warning);
        // Invalid finding: span without file.
        let err = ctx
            .emit()
            .finding(
                Level::Error,
                "bad",
                None,
                Span {
                    start: crate::finding::Pos { line: 1, col: 1 },
                    end: crate::finding::Pos { line: 1, col: 2 },
                },
                vec![],
            )
            .unwrap_err();
        assert!(format!("{err:#}").starts_with("ctx.emit.finding:"));
        // The failed emit must not bump the level.
        assert_eq!(ctx.reg.highest_level(), Level::Warning);
    }

    #[test]
    fn vars_get() {
        let (_dir, ctx) = fixture();
        assert_eq!(ctx.vars().get("profile").unwrap(), "debug");
        let err = ctx.vars().get("nope").unwrap_err();
        assert_eq!(format!("{err:#}"), "ctx.vars.get: unknown variable \"nope\"");
    }

    #[cfg(unix)]
    #[test]
    fn exec_is_tracked_and_swept() {
        let (_dir, ctx) = fixture();
        let handle = ctx
            .os()
            .exec(ExecRequest::new(vec![
                "/bin/sh".into(),
                "-c".into(),
                "printf hi".into(),
            ]))
            .unwrap();
        assert_eq!(handle.wait().unwrap().stdout, "hi");
        ctx.reg.sweep_subprocesses().unwrap();

        // An unwaited handle turns into a sweep error.
        let _leaked = ctx
            .os()
            .exec(ExecRequest::new(vec![
                "/bin/sh".into(),
                "-c".into(),
                "true".into(),
            ]))
            .unwrap();
        let err = ctx.reg.sweep_subprocesses().unwrap_err();
        assert!(format!("{err:#}").contains("wait() was not called"));
    }
}
