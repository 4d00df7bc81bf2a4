//! Post-fork reinitialization.
//!
//! `libc::fork()` duplicates the parent's address space, including every
//! socket file descriptor the pool is holding onto; those descriptors are
//! not safe to share between parent and child past the call. A pre-fork
//! worker manager (e.g. a gunicorn-style master process) that embeds this
//! crate will fork *after* the pool has already been constructed, so every
//! public entry point checks the current process id against the one
//! recorded at the last (re)initialization and, on mismatch, discards the
//! inherited state and starts clean.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::PoolError;

const FORK_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) struct ForkGuard {
    pid: AtomicI32,
    fork_lock: Mutex<()>,
}

impl ForkGuard {
    pub fn new() -> Self {
        Self {
            pid: AtomicI32::new(current_pid()),
            fork_lock: Mutex::new(()),
        }
    }

    /// Returns `Ok(true)` if the caller observed a pid change and must
    /// reinitialize pool state while holding the returned guard's effect;
    /// `Ok(false)` if nothing changed. `Err` only on fork-lock timeout.
    ///
    /// Takes a closure rather than returning a guard because the actual
    /// state swap needs to happen under `fork_lock`, and the recheck after
    /// acquiring it must be atomic with the swap (otherwise two threads
    /// racing the same fork could both decide to reinitialize).
    pub fn check_and_reinit(&self, reinit: impl FnOnce()) -> Result<(), PoolError> {
        let observed = current_pid();
        if self.pid.load(Ordering::SeqCst) == observed {
            return Ok(());
        }

        let guard = self
            .fork_lock
            .try_lock_for(FORK_LOCK_TIMEOUT)
            .ok_or(PoolError::Deadlocked)?;

        // Re-read under the lock: another thread may have already won the
        // race and reinitialized on our behalf.
        if self.pid.load(Ordering::SeqCst) != observed {
            reinit();
            self.pid.store(observed, Ordering::SeqCst);
        }
        drop(guard);
        Ok(())
    }
}

fn current_pid() -> i32 {
    // SAFETY: getpid has no preconditions and never fails.
    unsafe { libc::getpid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reinit_when_pid_unchanged() {
        let guard = ForkGuard::new();
        let mut called = false;
        guard.check_and_reinit(|| called = true).unwrap();
        assert!(!called);
    }
}
