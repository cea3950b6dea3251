//! Per-check subprocess execution.
//!
//! Each invocation gets a scoped temp-dir, a whitelisted environment, and a
//! mount policy, then runs under a process-wide concurrency budget: a
//! counting semaphore sized to the host CPU count plus two, shared by every
//! engine state so multi-root recursion can't oversubscribe the machine.
//! The semaphore permit is released when the process *exits*, not when the
//! check calls `wait`, so holding a handle cannot deadlock the pool.
//!
//! `Start` is serialized through a shared RW-lock: every spawner holds the
//! read side while its fork window is open, and a sandbox implementation
//! may take the write side while preparing file descriptors so concurrent
//! forks don't inherit them.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use anyhow::{Context, bail};
use tempfile::TempDir;

use crate::buffer::{self, PooledBuf};
use crate::cancel::{self, Subscription};
use crate::doc::Document;
use crate::sandbox::{Mount, Sandbox, SandboxConfig, common_mounts};

/// Hard cap on captured stdout and stderr, each.
const MAX_CAPTURE: usize = 10 << 20;

/// Subprocess concurrency budget and worker pool size: host CPUs plus two.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        + 2
}

struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

static EXEC_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(default_concurrency()));

static START_LOCK: RwLock<()> = RwLock::new(());

/// Held by every spawner across its fork window.
pub fn start_read() -> RwLockReadGuard<'static, ()> {
    START_LOCK.read().unwrap_or_else(|e| e.into_inner())
}

/// For sandbox implementations that must exclude concurrent forks while
/// file descriptors are in flight.
pub fn start_write() -> RwLockWriteGuard<'static, ()> {
    START_LOCK.write().unwrap_or_else(|e| e.into_inner())
}

/// A validated `exec` request, assembled by `ctx.os.exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    /// Relative to the check's subdir.
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    /// Ignored unless the document permits network access.
    pub allow_network: bool,
    /// Exit codes treated as success. Defaults to `{0}`; incompatible with
    /// `raise_on_failure = false`.
    pub ok_retcodes: Option<Vec<i32>>,
    pub raise_on_failure: bool,
}

impl ExecRequest {
    pub fn new(cmd: Vec<String>) -> ExecRequest {
        ExecRequest {
            cmd,
            raise_on_failure: true,
            ..ExecRequest::default()
        }
    }
}

/// Engine-state context an exec runs in.
pub struct ExecContext<'a> {
    /// Checkout root, the mount target and the escape boundary for `cwd`.
    pub checkout_root: &'a Path,
    /// The check's view root (checkout root plus subdir); relative paths
    /// resolve under it.
    pub view_root: &'a Path,
    /// The engine state's temp root; per-invocation temp-dirs nest under it.
    pub tmp_root: &'a Path,
    pub doc: &'a Document,
    pub sandbox: Arc<dyn Sandbox>,
}

/// A completed subprocess, as returned by [`Subprocess::wait`].
#[derive(Debug, Clone)]
pub struct CompletedSubprocess {
    pub retcode: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
struct IoThreads {
    stdout: JoinHandle<(PooledBuf, bool)>,
    stderr: JoinHandle<(PooledBuf, bool)>,
    stdin: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ExitState {
    code: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ExitState {
    fn wait_code(&self) -> i32 {
        let mut code = self.code.lock().unwrap();
        while code.is_none() {
            code = self.cond.wait(code).unwrap();
        }
        code.unwrap()
    }

    fn store(&self, value: i32) {
        *self.code.lock().unwrap() = Some(value);
        self.cond.notify_all();
    }
}

/// Handle to a started subprocess. `wait` is callable at most once; a
/// handle that is never waited on is swept (killed, cleaned, reported as an
/// error) when its check completes.
#[derive(Debug)]
pub struct Subprocess {
    cmd_line: String,
    ok_retcodes: Vec<i32>,
    raise_on_failure: bool,
    pid: u32,
    waited: AtomicBool,
    cleaned: AtomicBool,
    exit: Arc<ExitState>,
    io: Mutex<Option<IoThreads>>,
    temp_dir: Mutex<Option<TempDir>>,
    cancel_sub: Mutex<Option<Subscription>>,
}

impl Subprocess {
    /// Whether `wait` was called. Checked by the post-check sweep.
    pub fn waited(&self) -> bool {
        self.waited.load(Ordering::SeqCst)
    }

    /// The command line, for error messages.
    pub fn command_line(&self) -> String {
        self.cmd_line.clone()
    }

    /// Wait for the process and collect its result.
    ///
    /// Fails on a second call, on capture overflow, on cancellation, and —
    /// unless `raise_on_failure` was disabled — on an exit code outside
    /// `ok_retcodes`.
    pub fn wait(&self) -> anyhow::Result<CompletedSubprocess> {
        if self.waited.swap(true, Ordering::SeqCst) {
            bail!("wait was already called");
        }
        let code = self.exit.wait_code();
        let (stdout, stdout_over, stderr, stderr_over) = self.collect_io();
        self.temp_dir.lock().unwrap().take();
        self.cancel_sub.lock().unwrap().take();
        self.cleaned.store(true, Ordering::SeqCst);

        if stdout_over {
            bail!("process stdout exceeded {} bytes", MAX_CAPTURE);
        }
        if stderr_over {
            bail!("process stderr exceeded {} bytes", MAX_CAPTURE);
        }
        cancel::current().check()?;

        if !self.ok_retcodes.contains(&code) && self.raise_on_failure {
            let mut msg = format!("command failed with exit code {code}: {}", self.cmd_line);
            if !stderr.trim().is_empty() {
                msg.push('\n');
                msg.push_str(stderr.trim_end());
            }
            bail!("{msg}");
        }
        Ok(CompletedSubprocess {
            retcode: code,
            stdout,
            stderr,
        })
    }

    /// Kill and release everything still held. Idempotent; called by the
    /// post-check sweep for handles that were never waited on.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.exit.code.lock().unwrap().is_none() {
            kill_pid(self.pid);
        }
        self.exit.wait_code();
        self.collect_io();
        self.temp_dir.lock().unwrap().take();
        self.cancel_sub.lock().unwrap().take();
    }

    fn collect_io(&self) -> (String, bool, String, bool) {
        let Some(io) = self.io.lock().unwrap().take() else {
            return (String::new(), false, String::new(), false);
        };
        if let Some(stdin) = io.stdin {
            let _ = stdin.join();
        }
        let (out_buf, out_over) = io
            .stdout
            .join()
            .unwrap_or_else(|_| (buffer::pool().get(), false));
        let (err_buf, err_over) = io
            .stderr
            .join()
            .unwrap_or_else(|_| (buffer::pool().get(), false));
        let stdout = String::from_utf8_lossy(&out_buf).into_owned();
        let stderr = String::from_utf8_lossy(&err_buf).into_owned();
        buffer::pool().put(out_buf);
        buffer::pool().put(err_buf);
        (stdout, out_over, stderr, err_over)
    }
}

fn kill_pid(pid: u32) {
    #[cfg(unix)]
    // SAFETY: sending SIGKILL to a pid we spawned and have not yet reaped.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Validate `req`, acquire a concurrency permit, and start the process
/// under the configured sandbox.
pub fn start(ctx: &ExecContext<'_>, req: ExecRequest) -> anyhow::Result<Arc<Subprocess>> {
    if req.cmd.is_empty() || req.cmd[0].is_empty() {
        bail!("cmd must not be empty");
    }
    if req.ok_retcodes.is_some() && !req.raise_on_failure {
        bail!("cannot use both ok_retcodes and raise_on_failure=False");
    }
    for (key, _) in &req.env {
        if key.is_empty() {
            bail!("env keys must not be empty");
        }
        if key == "PATH" {
            bail!("env cannot override PATH");
        }
    }
    let cwd = resolve_cwd(ctx.checkout_root, ctx.view_root, req.cwd.as_deref())?;
    let cancel = cancel::current();
    cancel.check()?;

    EXEC_SEMAPHORE.acquire();
    match start_locked(ctx, req, cwd, &cancel) {
        Ok(subprocess) => Ok(subprocess),
        Err(err) => {
            // The monitor thread never started; give the permit back here.
            EXEC_SEMAPHORE.release();
            Err(err)
        }
    }
}

fn start_locked(
    ctx: &ExecContext<'_>,
    mut req: ExecRequest,
    cwd: PathBuf,
    cancel: &cancel::Cancellation,
) -> anyhow::Result<Arc<Subprocess>> {
    let temp_dir = tempfile::Builder::new()
        .prefix("exec-")
        .tempdir_in(ctx.tmp_root)
        .context("failed to create subprocess temp-dir")?;

    let host_path = std::env::var("PATH").unwrap_or_default();
    let env = build_env(
        &host_path,
        temp_dir.path(),
        ctx.doc,
        std::mem::take(&mut req.env),
    );

    let exe = resolve_executable(&req.cmd[0], ctx.view_root, &host_path, &cwd)?;
    let mut cmd_vec = req.cmd.clone();
    cmd_vec[0] = exe;
    let cmd_line = req.cmd.join(" ");

    let config = SandboxConfig {
        cmd: cmd_vec,
        cwd,
        env,
        mounts: build_mounts(ctx, temp_dir.path(), &host_path),
        allow_network: req.allow_network && ctx.doc.allow_network,
    };

    let mut command = ctx.sandbox.command(&config)?;
    command
        .stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::debug!("$ {cmd_line} [{}]", config.cwd.display());
    let mut child = {
        let _fork_window = start_read();
        command
            .spawn()
            .with_context(|| format!("failed to start: {cmd_line}"))?
    };
    let pid = child.id();

    let stdin_thread = req.stdin.take().map(|content| {
        let mut pipe = child.stdin.take().expect("stdin was piped");
        std::thread::spawn(move || {
            // A child that exits without reading gives EPIPE; that's its
            // prerogative.
            let _ = pipe.write_all(&content);
        })
    });
    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_thread = std::thread::spawn(move || capture(stdout_pipe));
    let stderr_thread = std::thread::spawn(move || capture(stderr_pipe));

    let exit = Arc::new(ExitState {
        code: Mutex::new(None),
        cond: Condvar::new(),
    });
    let monitor_exit = exit.clone();
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        // Exit frees the permit; `wait` on the handle is unrelated.
        EXEC_SEMAPHORE.release();
        monitor_exit.store(code);
    });

    let cancel_sub = cancel.subscribe(Box::new(move || kill_pid(pid)));

    Ok(Arc::new(Subprocess {
        cmd_line,
        ok_retcodes: req.ok_retcodes.unwrap_or_else(|| vec![0]),
        raise_on_failure: req.raise_on_failure,
        pid,
        waited: AtomicBool::new(false),
        cleaned: AtomicBool::new(false),
        exit,
        io: Mutex::new(Some(IoThreads {
            stdout: stdout_thread,
            stderr: stderr_thread,
            stdin: stdin_thread,
        })),
        temp_dir: Mutex::new(Some(temp_dir)),
        cancel_sub: Mutex::new(Some(cancel_sub)),
    }))
}

/// Drain a pipe into a pooled buffer, capping retention at [`MAX_CAPTURE`].
/// Keeps draining past the cap so the child never blocks on a full pipe.
fn capture(mut pipe: impl Read) -> (PooledBuf, bool) {
    let mut buf = buffer::pool().get();
    let mut chunk = [0u8; 64 * 1024];
    let mut overflow = false;
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() + n > MAX_CAPTURE {
                    overflow = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (buf, overflow)
}

/// Seed `PATH` from the host and the temp-dir variables, then overlay
/// passthrough entries (resolved from the host) and the user-supplied env.
fn build_env(
    host_path: &str,
    temp_dir: &Path,
    doc: &Document,
    user_env: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();
    env.insert("PATH".into(), host_path.to_string());
    let temp = temp_dir.to_string_lossy().into_owned();
    env.insert("TEMP".into(), temp.clone());
    env.insert("TMPDIR".into(), temp.clone());
    env.insert("TEMPDIR".into(), temp);
    for entry in &doc.passthrough_env {
        if let Ok(value) = std::env::var(&entry.name) {
            env.insert(entry.name.clone(), value);
        }
    }
    for (key, value) in user_env {
        env.insert(key, value);
    }
    env.into_iter().collect()
}

/// Resolve `cmd0`: absolute paths are stat-checked directly; relative paths
/// first try the check's view root, then `$PATH`.
fn resolve_executable(
    cmd0: &str,
    view_root: &Path,
    host_path: &str,
    cwd: &Path,
) -> anyhow::Result<String> {
    if Path::new(cmd0).is_absolute() {
        std::fs::metadata(cmd0).with_context(|| format!("could not find {cmd0:?}"))?;
        return Ok(cmd0.to_string());
    }
    let local = view_root.join(cmd0);
    if local.is_file() {
        return Ok(local.to_string_lossy().into_owned());
    }
    let found = which::which_in(cmd0, Some(host_path), cwd)
        .with_context(|| format!("could not find {cmd0:?} in PATH"))?;
    Ok(found.to_string_lossy().into_owned())
}

fn build_mounts(ctx: &ExecContext<'_>, temp_dir: &Path, host_path: &str) -> Vec<Mount> {
    if cfg!(windows) {
        return Vec::new();
    }
    let mut mounts = vec![
        Mount {
            path: ctx.checkout_root.to_path_buf(),
            writeable: ctx.doc.writable_root,
        },
        // The temp-dir parent, so the process can use its scratch space.
        Mount::writeable(temp_dir.parent().unwrap_or(ctx.tmp_root).to_path_buf()),
    ];
    mounts.extend(common_mounts(host_path));
    for entry in &ctx.doc.passthrough_env {
        if !entry.is_path {
            continue;
        }
        if let Ok(value) = std::env::var(&entry.name) {
            let path = PathBuf::from(value);
            if path.exists() {
                mounts.push(Mount {
                    path,
                    writeable: entry.writeable,
                });
            }
        }
    }
    mounts
}

/// Lexically resolve the subprocess working directory under the view root,
/// rejecting escapes past the checkout root.
fn resolve_cwd(
    checkout_root: &Path,
    view_root: &Path,
    cwd: Option<&str>,
) -> anyhow::Result<PathBuf> {
    let mut resolved = view_root.to_path_buf();
    let Some(cwd) = cwd else {
        return Ok(resolved);
    };
    if Path::new(cwd).is_absolute() {
        bail!("cwd must be a relative path");
    }
    let mut depth: i64 = view_root
        .strip_prefix(checkout_root)
        .map(|rel| rel.components().count() as i64)
        .unwrap_or(0);
    for segment in cwd.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    bail!("cannot escape root");
                }
                resolved.pop();
            }
            _ => {
                depth += 1;
                resolved.push(segment);
            }
        }
    }
    Ok(resolved)
}
