//! Per-thread cooperative interrupt flags.
//!
//! Rust threads cannot be interrupted from the outside, so every thread
//! carries an `InterruptFlag` that other threads may raise. Blocking helpers
//! in this module (`sleep`, `InterruptFlag::wait_timeout`) wake immediately
//! when the flag is raised, and long-running callbacks poll `is_interrupted`.
//!
//! # Usage
//! ```ignore
//! // On the worker thread:
//! let flag = interrupt::current();
//! while !flag.is_interrupted() {
//!     // do work ...
//!     if interrupt::sleep(Duration::from_millis(50)).is_err() {
//!         break;
//!     }
//! }
//!
//! // From the controlling thread:
//! flag_clone.interrupt(); // wakes the worker immediately
//! ```
//!
//! A raised flag stays raised until somebody calls `clear()` or
//! `interrupted()`, so cancellation stays observable after the call that
//! noticed it returns.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Interrupted;

thread_local! {
    static CURRENT: RefCell<InterruptFlag> = RefCell::new(InterruptFlag::new());
}

/// A cloneable interrupt flag backed by `Condvar` so sleepers wake as soon
/// as it is raised.
#[derive(Clone)]
pub struct InterruptFlag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl InterruptFlag {
    /// Create a new flag in the lowered state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlagInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Raise the flag. Wakes every thread sleeping on it.
    pub fn interrupt(&self) {
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Check the flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Test-and-clear. Returns whether the flag was raised.
    pub fn interrupted(&self) -> bool {
        self.inner.flag.swap(false, Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early if the flag is raised.
    /// Returns `true` if the flag is raised (caller should stop).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_interrupted() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .inner
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        self.is_interrupted()
    }

    /// Same flag (not just an equal state).
    pub fn same_as(&self, other: &InterruptFlag) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterruptFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptFlag")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// The calling thread's interrupt flag.
pub fn current() -> InterruptFlag {
    CURRENT.with(|c| c.borrow().clone())
}

/// Replace the calling thread's flag, returning the previous one. Worker
/// threads install a flag owned by whoever needs to interrupt them.
pub fn install(flag: InterruptFlag) -> InterruptFlag {
    CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), flag))
}

/// Whether the calling thread's flag is raised. Does not clear it.
pub fn is_interrupted() -> bool {
    current().is_interrupted()
}

/// Test-and-clear the calling thread's flag.
pub fn interrupted() -> bool {
    current().interrupted()
}

/// `Err(Interrupted)` if the calling thread's flag is raised.
pub fn check() -> Result<(), Interrupted> {
    if is_interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Interruptible sleep on the calling thread's flag.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    if current().wait_timeout(duration) {
        Err(Interrupted)
    } else {
        Ok(())
    }
}
