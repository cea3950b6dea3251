//! Run-wide cooperative cancellation.
//!
//! A run carries one [`Cancellation`] token. Blocking builtins consult the
//! ambient token (plumbed through thread-local storage, not through every
//! signature) and fail fast once it trips. Subscribers — running
//! subprocesses, mostly — are invoked at cancellation time so they can kill
//! what they own.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Error representing a cancelled run. The payload is the cancellation
/// cause, typically the first failed check.
#[derive(Debug, Clone)]
pub struct Cancelled(pub String);

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Cancelled {}

/// Returns true if `err` is (or wraps) a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Cancelled>())
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    cause: Mutex<Option<String>>,
    subscribers: Mutex<HashMap<u64, Box<dyn Fn() + Send>>>,
    next_id: Mutex<u64>,
}

/// Cloneable cancellation token shared by everything in one run.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. The first cause wins; later calls are no-ops.
    /// Subscribers registered at this point are invoked once.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut guard = self.inner.cause.lock().unwrap();
            if guard.is_some() {
                return;
            }
            *guard = Some(cause.into());
        }
        self.inner.flag.store(true, Ordering::SeqCst);
        let subscribers = self.inner.subscribers.lock().unwrap();
        for f in subscribers.values() {
            f();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// The recorded cause, once cancelled.
    pub fn cause(&self) -> Option<String> {
        self.inner.cause.lock().unwrap().clone()
    }

    /// Fail fast: returns the cancellation cause as an error if tripped.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            let cause = self.cause().unwrap_or_else(|| "run cancelled".to_string());
            return Err(Cancelled(cause).into());
        }
        Ok(())
    }

    /// Register a callback to run at cancellation. If the token already
    /// tripped, the callback runs immediately. The returned guard
    /// unregisters on drop.
    pub fn subscribe(&self, f: Box<dyn Fn() + Send>) -> Subscription {
        if self.is_cancelled() {
            f();
            return Subscription {
                token: self.clone(),
                id: None,
            };
        }
        let id = {
            let mut next = self.inner.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.inner.subscribers.lock().unwrap().insert(id, f);
        // Cancellation may have raced in between the check and the insert;
        // deliver the callback ourselves in that case.
        if self.is_cancelled() {
            if let Some(f) = self.inner.subscribers.lock().unwrap().remove(&id) {
                f();
            }
            return Subscription {
                token: self.clone(),
                id: None,
            };
        }
        Subscription {
            token: self.clone(),
            id: Some(id),
        }
    }
}

/// Unregisters its callback when dropped.
pub struct Subscription {
    token: Cancellation,
    id: Option<u64>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.token.inner.subscribers.lock().unwrap().remove(&id);
        }
    }
}

thread_local! {
    static AMBIENT: RefCell<Option<Cancellation>> = const { RefCell::new(None) };
}

/// The ambient token for the current thread. Threads outside any run scope
/// get a fresh token that never trips.
pub fn current() -> Cancellation {
    AMBIENT.with(|cell| cell.borrow().clone()).unwrap_or_default()
}

/// Run `f` with `token` installed as the current thread's ambient token.
pub fn scope<T>(token: &Cancellation, f: impl FnOnce() -> T) -> T {
    struct Restore(Option<Cancellation>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            AMBIENT.with(|cell| *cell.borrow_mut() = prev);
        }
    }
    let prev = AMBIENT.with(|cell| cell.borrow_mut().replace(token.clone()));
    let _restore = Restore(prev);
    f()
}
