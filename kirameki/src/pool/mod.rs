//! A priority-ordered, thread-safe pool of [`Connection`]s.
//!
//! [`PriorityPool`] checks connections out oldest-idle-first, creates new
//! connections on a dedicated background thread, recycles connections past
//! `stale_timeout`, and reinitializes itself after the owning process forks.
//! See the crate-level documentation for the full design rationale.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::{Connection, TransactionStatus};
use crate::error::PoolError;

mod creator;
mod entry;
mod fork;
mod inner;
mod options;
mod queue;

pub use options::PoolOptions;

use fork::ForkGuard;
use inner::Inner;

/// A priority-ordered pool of database connections.
///
/// Checkout favors the oldest idle connection (entries are tracked
/// internally as age-stamped `PoolEntry`s), which
/// maximizes the chance that a connection nearing `stale_timeout` is
/// recycled rather than lingering at the bottom of the queue. Cloning a
/// `PriorityPool` is cheap and shares the same underlying state; clone it
/// rather than wrapping it in an `Arc` yourself.
pub struct PriorityPool<C: Connection + 'static> {
    shared: Arc<Shared<C>>,
}

/// The part of a pool's state every clone must observe in common: the
/// current-generation [`Inner`] (swapped wholesale on fork reinit) and the
/// fork guard that decides when to swap it. Held behind one `Arc` so a
/// reinit triggered through any clone is visible to all the others.
struct Shared<C: Connection + 'static> {
    inner: Mutex<Arc<Inner<C>>>,
    fork_guard: ForkGuard,
}

impl<C: Connection + 'static> Clone for PriorityPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connection + 'static> PriorityPool<C> {
    /// Builds a new pool and schedules background creation up to `minconn`.
    pub fn new(options: PoolOptions<C>) -> Result<Self, PoolError> {
        options.validate().map_err(PoolError::Config)?;
        let inner = Inner::new(options);
        inner.ensure_minconn();
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                fork_guard: ForkGuard::new(),
            }),
        })
    }

    /// Checks out a connection, blocking up to `timeout` (or the pool's
    /// configured `get_timeout`, or indefinitely if neither is set).
    ///
    /// Schedules a background creation first if the pool has room to grow,
    /// so the *next* waiter benefits even while this call blocks.
    pub fn get_connection(&self, timeout: Option<Duration>) -> Result<PoolConnection<C>, PoolError> {
        let inner = self.guard()?;
        inner.ensure_capacity();

        let timeout = timeout.or(inner.options.get_timeout);
        let entry = inner.idle.get(timeout)?;

        if inner.closed() {
            let _ = entry.conn.close();
            return Err(PoolError::Closed);
        }

        inner
            .in_use
            .lock()
            .unwrap()
            .insert(entry.conn.id(), entry.created_on);

        Ok(PoolConnection {
            pool: inner,
            conn: Some(entry.conn),
        })
    }

    /// Returns a checked-out connection to the pool.
    ///
    /// `discard = true` forces the connection to be closed and a
    /// replacement scheduled, regardless of its health. Fails with
    /// [`PoolError::Foreign`] if `conn` was already returned (the guard's
    /// `Drop` impl calls this automatically, so this is only reachable via
    /// a double explicit return).
    pub fn return_connection(&self, mut conn: PoolConnection<C>, discard: bool) -> Result<(), PoolError> {
        let raw = conn.conn.take().ok_or(PoolError::Foreign)?;
        let pool = Arc::clone(&conn.pool);
        pool.release(raw, discard)
    }

    /// Drains in-use and idle connections, shuts down the background
    /// creator, and wakes every blocked waiter with [`PoolError::Closed`].
    /// Idempotent and safe to call concurrently from multiple threads.
    pub fn close(&self) -> Result<(), PoolError> {
        self.guard()?.close()
    }

    pub fn closed(&self) -> bool {
        self.shared.inner.lock().closed()
    }

    /// Best-effort count of idle + in-use + in-flight connections. See
    /// the crate-level notes on why this is approximate.
    pub fn size(&self) -> usize {
        self.shared.inner.lock().live_count()
    }

    /// Runs the closed check and fork check every public operation
    /// performs, returning the (possibly freshly reinitialized) shared
    /// state to operate on.
    fn guard(&self) -> Result<Arc<Inner<C>>, PoolError> {
        let snapshot = self.shared.inner.lock().clone();
        if snapshot.closed() {
            return Err(PoolError::Closed);
        }

        self.shared.fork_guard.check_and_reinit(|| {
            log::warn!("pool used from a new process id; discarding inherited connections");
            let mut guard = self.shared.inner.lock();
            *guard = Inner::new(guard.options.clone());
            guard.ensure_minconn();
        })?;

        Ok(self.shared.inner.lock().clone())
    }
}

/// An RAII guard around a checked-out [`Connection`].
///
/// Returns the connection to its originating pool on drop, resetting its
/// session and recycling it if it's healthy and not stale, or closing it
/// and scheduling a replacement otherwise. Use
/// [`PriorityPool::return_connection`] instead of letting this drop if you
/// need to force a discard or observe reset failures.
pub struct PoolConnection<C: Connection + 'static> {
    pool: Arc<Inner<C>>,
    conn: Option<C>,
}

impl<C: Connection + 'static> PoolConnection<C> {
    /// Whether the connection is currently reporting an in-progress or
    /// failed transaction rather than `Idle`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.as_ref().transaction_status()
    }
}

impl<C: Connection + 'static> Deref for PoolConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
            .as_ref()
            .expect("connection already returned to the pool")
    }
}

impl<C: Connection + 'static> DerefMut for PoolConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .expect("connection already returned to the pool")
    }
}

impl<C: Connection + 'static> AsRef<C> for PoolConnection<C> {
    fn as_ref(&self) -> &C {
        self
    }
}

impl<C: Connection + 'static> Drop for PoolConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.release(conn, false) {
                log::warn!("error returning connection to pool: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;
    use std::sync::mpsc;
    use std::thread;

    fn wait_for<C: Connection + 'static>(pool: &PriorityPool<C>, n: usize) {
        for _ in 0..200 {
            if pool.size() >= n {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("pool never reached size {n}");
    }

    #[test]
    fn stale_connections_are_recycled_on_return() {
        let options = PoolOptions::new(MockConnection::factory())
            .minconn(1)
            .maxconn(2)
            .stale_timeout(Duration::from_secs(0));
        let pool = PriorityPool::new(options).unwrap();
        wait_for(&pool, 1);

        let first = pool.get_connection(Some(Duration::from_secs(1))).unwrap();
        let first_id = first.id();
        drop(first);

        wait_for(&pool, 1);
        let second = pool.get_connection(Some(Duration::from_secs(1))).unwrap();
        assert_ne!(first_id, second.id(), "a stale connection must not be handed back out");
    }

    #[test]
    fn close_wakes_every_blocked_waiter_without_hanging() {
        let options = PoolOptions::new(MockConnection::factory()).minconn(1).maxconn(1);
        let pool = PriorityPool::new(options).unwrap();
        wait_for(&pool, 1);

        // Hold the only connection so subsequent checkouts have to block.
        let held = pool.get_connection(Some(Duration::from_secs(1))).unwrap();

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = pool.get_connection(None);
                    tx.send(result.is_err()).unwrap();
                })
            })
            .collect();

        // Give the waiters time to actually block on the idle queue.
        thread::sleep(Duration::from_millis(100));
        pool.close().unwrap();

        for _ in 0..3 {
            let was_closed_err = rx.recv_timeout(Duration::from_secs(2)).expect("waiter never woke up");
            assert!(was_closed_err, "blocked waiter should fail with PoolError::Closed");
        }
        for handle in handles {
            handle.join().unwrap();
        }
        drop(held);
    }
}
