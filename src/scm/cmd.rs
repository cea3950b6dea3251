//! Hermetic git command invocation.
//!
//! All git commands in the engine go through this module to ensure a frozen,
//! config-isolated environment and consistent debug logging. Output is
//! captured through the process-wide buffer pool.

use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, bail};

use crate::buffer;

/// A completed git invocation. `code` is the exit code, `-1` for a signal
/// death.
#[derive(Debug)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// The frozen environment used for every git invocation: a copy of the
/// caller environment taken once at first use, with global/system config,
/// locale, and external diff drivers neutralized. `core.precomposeUnicode`
/// is injected through `GIT_CONFIG_COUNT` so macOS path listings come back
/// in a single normalization form.
fn git_env() -> &'static Vec<(OsString, OsString)> {
    static ENV: OnceLock<Vec<(OsString, OsString)>> = OnceLock::new();
    ENV.get_or_init(|| {
        let overridden = [
            "GIT_CONFIG_NOGLOBAL",
            "GIT_CONFIG_GLOBAL",
            "GIT_CONFIG_SYSTEM",
            "GIT_EXTERNAL_DIFF",
            "GIT_DIFF_OPTS",
            "LANG",
            "GIT_CONFIG_COUNT",
            "GIT_CONFIG_KEY_0",
            "GIT_CONFIG_VALUE_0",
        ];
        let mut env: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(k, _)| !overridden.iter().any(|o| k == o))
            .collect();
        env.push(("GIT_CONFIG_NOGLOBAL".into(), "true".into()));
        env.push(("GIT_CONFIG_GLOBAL".into(), "".into()));
        env.push(("GIT_CONFIG_SYSTEM".into(), "".into()));
        env.push(("GIT_EXTERNAL_DIFF".into(), "".into()));
        env.push(("GIT_DIFF_OPTS".into(), "".into()));
        env.push(("LANG".into(), "C".into()));
        env.push(("GIT_CONFIG_COUNT".into(), "1".into()));
        env.push(("GIT_CONFIG_KEY_0".into(), "core.precomposeUnicode".into()));
        env.push(("GIT_CONFIG_VALUE_0".into(), "true".into()));
        env
    })
}

/// Run a read-only git command in `dir`, capturing output.
///
/// Every invocation gets `--no-optional-locks` so listing commands never
/// take the index lock out from under a concurrent git. A spawn failure is
/// an error; a non-zero exit is reported through [`GitOutput::code`] and
/// left to the caller to classify.
pub fn git_output(dir: &Path, args: &[&str]) -> anyhow::Result<GitOutput> {
    let cmd_str = format!("git {}", args.join(" "));
    log::debug!("$ {cmd_str} [{}]", dir.display());

    let mut cmd = Command::new("git");
    cmd.arg("--no-optional-locks")
        .args(args)
        .current_dir(dir)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in git_env() {
        cmd.env(k, v);
    }

    let t0 = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to execute: {cmd_str}"))?;

    let pool = buffer::pool();
    let mut out = pool.get();
    let mut err = pool.get();
    // stderr is small for the read-only commands we run; draining stdout
    // first cannot deadlock unless git fills the stderr pipe buffer, which
    // none of these commands do.
    child
        .stdout
        .take()
        .expect("stdout was piped")
        .read_to_end(&mut out)?;
    child
        .stderr
        .take()
        .expect("stderr was piped")
        .read_to_end(&mut err)?;
    let status = child.wait()?;

    let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;
    log::debug!(
        "[git-trace] cmd=\"{cmd_str}\" dur={duration_ms:.1}ms ok={}",
        status.success()
    );

    let result = GitOutput {
        code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
    };
    pool.put(out);
    pool.put(err);
    Ok(result)
}

/// Run a git command and return its stdout, failing on non-zero exit with
/// whatever git printed.
pub fn git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = git_output(dir, args)?;
    if !output.success() {
        // Some git commands print errors to stdout; join both streams.
        let msg = [output.stderr.trim(), output.stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        bail!("git {} failed: {msg}", args.join(" "));
    }
    Ok(output.stdout)
}
