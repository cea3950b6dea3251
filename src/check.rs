//! Check objects and the per-state registry.
//!
//! Script code constructs a [`Check`] from a callable (optionally binding
//! keyword arguments and a name) and registers it. Registration is only
//! valid during phase 1; once loading completes the registry is frozen.

use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::engine::ctx::CheckCtx;
use crate::exec::Subprocess;
use crate::finding::Level;

/// Keyword arguments bound to a check callable.
pub type KwArgs = serde_json::Map<String, serde_json::Value>;

pub type CheckFn = Arc<dyn Fn(&CheckCtx, &KwArgs) -> anyhow::Result<()> + Send + Sync>;

/// One declared parameter of a check callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub has_default: bool,
}

impl Param {
    pub fn required(name: &str) -> Param {
        Param {
            name: name.into(),
            has_default: false,
        }
    }

    pub fn optional(name: &str) -> Param {
        Param {
            name: name.into(),
            has_default: true,
        }
    }
}

/// A script callable plus the shape metadata the registry validates.
///
/// The evaluator owns the function value; what crosses the boundary is its
/// declared parameter list and an invocation thunk.
#[derive(Clone)]
pub struct CheckCallable {
    /// Function name, the default check name.
    pub name: String,
    pub params: Vec<Param>,
    pub has_varargs: bool,
    pub has_kwargs: bool,
    /// Built-in functions cannot be registered as checks.
    pub builtin: bool,
    pub func: CheckFn,
}

impl std::fmt::Debug for CheckCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckCallable")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A check: a validated callable, its registered name, the formatter flag,
/// and any bound keyword arguments. Frozen after registration.
#[derive(Debug, Clone)]
pub struct Check {
    pub callable: CheckCallable,
    pub name: String,
    pub formatter: bool,
    pub args: KwArgs,
}

impl Check {
    /// Validate the callable shape and bind `args`.
    ///
    /// The callable must be script-defined, take `ctx` as its only required
    /// parameter, and declare no variadic parameters; every bound keyword
    /// must name a declared optional parameter.
    pub fn new(
        callable: CheckCallable,
        name: Option<String>,
        formatter: bool,
        args: KwArgs,
    ) -> anyhow::Result<Check> {
        if callable.builtin {
            bail!("callback must be a function defined in a script, not a built-in");
        }
        match callable.params.first() {
            Some(first) if first.name == "ctx" && !first.has_default => {}
            _ => bail!(
                "callback {:?} must take \"ctx\" as its first required parameter",
                callable.name
            ),
        }
        if callable.has_varargs || callable.has_kwargs {
            bail!(
                "callback {:?} must not take variadic parameters",
                callable.name
            );
        }
        if let Some(param) = callable.params[1..].iter().find(|p| !p.has_default) {
            bail!(
                "callback {:?}: parameter {:?} must have a default",
                callable.name,
                param.name
            );
        }
        let check = Check {
            name: name.unwrap_or_else(|| callable.name.clone()),
            callable,
            formatter,
            args: KwArgs::new(),
        };
        check.with_args(None, args)
    }

    /// A copy with `args` merged over the existing bindings, optionally
    /// renamed. This is how one callable serves several configurations.
    pub fn with_args(&self, name: Option<String>, args: KwArgs) -> anyhow::Result<Check> {
        for key in args.keys() {
            let declared = self
                .callable
                .params
                .iter()
                .any(|p| p.has_default && p.name == *key);
            if !declared {
                bail!(
                    "check {:?}: no parameter named {key:?} to bind",
                    self.name
                );
            }
        }
        let mut merged = self.args.clone();
        merged.extend(args);
        Ok(Check {
            callable: self.callable.clone(),
            name: name.unwrap_or_else(|| self.name.clone()),
            formatter: self.formatter,
            args: merged,
        })
    }
}

/// Run-time state of one registered check.
#[derive(Default)]
struct RunState {
    highest: Option<Level>,
    subprocesses: Vec<Arc<Subprocess>>,
}

/// A [`Check`] plus its run-time state: highest level emitted and the
/// subprocesses it started.
pub struct RegisteredCheck {
    pub check: Check,
    state: Mutex<RunState>,
}

impl RegisteredCheck {
    fn new(check: Check) -> RegisteredCheck {
        RegisteredCheck {
            check,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.check.name
    }

    /// Record a finding level; the highest one sticks.
    pub fn record_level(&self, level: Level) {
        let mut state = self.state.lock().unwrap();
        if state.highest.is_none_or(|h| level > h) {
            state.highest = Some(level);
        }
    }

    /// Highest level emitted so far; `Notice` when nothing was emitted.
    pub fn highest_level(&self) -> Level {
        self.state.lock().unwrap().highest.unwrap_or(Level::Notice)
    }

    pub fn track_subprocess(&self, subprocess: Arc<Subprocess>) {
        self.state.lock().unwrap().subprocesses.push(subprocess);
    }

    /// Clean up subprocesses at check completion. Returns an error naming
    /// the first process whose `wait` was never called.
    pub fn sweep_subprocesses(&self) -> anyhow::Result<()> {
        let subprocesses = std::mem::take(&mut self.state.lock().unwrap().subprocesses);
        let mut unwaited = None;
        for subprocess in subprocesses {
            if !subprocess.waited() && unwaited.is_none() {
                unwaited = Some(subprocess.command_line());
            }
            subprocess.cleanup();
        }
        match unwaited {
            Some(cmd) => bail!("wait() was not called on [{cmd}]"),
            None => Ok(()),
        }
    }
}

/// Per-engine-state check registry. Registration is forbidden once
/// [`CheckRegistry::freeze`] runs at the end of phase 1.
#[derive(Default)]
pub struct CheckRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    checks: Vec<Arc<RegisteredCheck>>,
    done_loading: bool,
}

impl CheckRegistry {
    pub fn new() -> CheckRegistry {
        CheckRegistry::default()
    }

    pub fn register(&self, check: Check) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done_loading {
            bail!("can't register checks after done loading");
        }
        if inner.checks.iter().any(|c| c.name() == check.name) {
            bail!("can't register two checks with the same name {:?}", check.name);
        }
        inner.checks.push(Arc::new(RegisteredCheck::new(check)));
        Ok(())
    }

    /// End of phase 1; all later registrations fail.
    pub fn freeze(&self) {
        self.inner.lock().unwrap().done_loading = true;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().checks.is_empty()
    }

    pub fn checks(&self) -> Vec<Arc<RegisteredCheck>> {
        self.inner.lock().unwrap().checks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callable(name: &str, params: Vec<Param>) -> CheckCallable {
        CheckCallable {
            name: name.into(),
            params,
            has_varargs: false,
            has_kwargs: false,
            builtin: false,
            func: Arc::new(|_ctx, _args| Ok(())),
        }
    }

    fn ctx_only(name: &str) -> CheckCallable {
        noop_callable(name, vec![Param::required("ctx")])
    }

    #[test]
    fn valid_shapes() {
        Check::new(ctx_only("cb"), None, false, KwArgs::new()).unwrap();
        Check::new(
            noop_callable("cb", vec![Param::required("ctx"), Param::optional("max_len")]),
            Some("line_length".into()),
            false,
            KwArgs::new(),
        )
        .unwrap();
    }

    #[test]
    fn invalid_shapes() {
        // No parameters at all.
        assert!(Check::new(noop_callable("cb", vec![]), None, false, KwArgs::new()).is_err());
        // First parameter not ctx.
        assert!(
            Check::new(
                noop_callable("cb", vec![Param::required("context")]),
                None,
                false,
                KwArgs::new()
            )
            .is_err()
        );
        // ctx with a default.
        assert!(
            Check::new(
                noop_callable("cb", vec![Param::optional("ctx")]),
                None,
                false,
                KwArgs::new()
            )
            .is_err()
        );
        // Required parameter after ctx.
        assert!(
            Check::new(
                noop_callable("cb", vec![Param::required("ctx"), Param::required("x")]),
                None,
                false,
                KwArgs::new()
            )
            .is_err()
        );
        // Variadics.
        let mut varargs = ctx_only("cb");
        varargs.has_varargs = true;
        assert!(Check::new(varargs, None, false, KwArgs::new()).is_err());
        // Built-in.
        let mut builtin = ctx_only("cb");
        builtin.builtin = true;
        assert!(Check::new(builtin, None, false, KwArgs::new()).is_err());
    }

    #[test]
    fn with_args_binds_declared_params_only() {
        let callable = noop_callable(
            "cb",
            vec![Param::required("ctx"), Param::optional("max_len")],
        );
        let check = Check::new(callable, None, false, KwArgs::new()).unwrap();
        let mut args = KwArgs::new();
        args.insert("max_len".into(), serde_json::json!(120));
        let bound = check.with_args(Some("wide".into()), args).unwrap();
        assert_eq!(bound.name, "wide");
        assert_eq!(bound.args["max_len"], serde_json::json!(120));

        let mut unknown = KwArgs::new();
        unknown.insert("nope".into(), serde_json::json!(1));
        assert!(check.with_args(None, unknown).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = CheckRegistry::new();
        let check = Check::new(ctx_only("cb"), None, false, KwArgs::new()).unwrap();
        registry.register(check.clone()).unwrap();
        let err = registry.register(check).unwrap_err();
        assert!(format!("{err:#}").contains("same name"));
    }

    #[test]
    fn registration_after_freeze_fails() {
        let registry = CheckRegistry::new();
        registry.freeze();
        let check = Check::new(ctx_only("cb"), None, false, KwArgs::new()).unwrap();
        let err = registry.register(check).unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            "can't register checks after done loading"
        );
    }

    #[test]
    fn highest_level_is_sticky() {
        let check = Check::new(ctx_only("cb"), None, false, KwArgs::new()).unwrap();
        let registered = RegisteredCheck::new(check);
        assert_eq!(registered.highest_level(), Level::Notice);
        registered.record_level(Level::Error);
        registered.record_level(Level::Warning);
        assert_eq!(registered.highest_level(), Level::Error);
    }
}
