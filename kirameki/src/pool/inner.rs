use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::creator::Creator;
use super::entry::PoolEntry;
use super::options::PoolOptions;
use super::queue::IdleQueue;
use crate::connection::{Connection, TransactionStatus};
use crate::error::{CloseErrors, PoolError};

/// State shared by every handle to a live pool, rebuilt wholesale whenever
/// `PriorityPool` detects it is running in a forked child (see
/// `pool::fork`).
pub(crate) struct Inner<C: Connection + 'static> {
    pub options: PoolOptions<C>,
    pub idle: IdleQueue<C>,
    pub in_use: Mutex<HashMap<u64, Instant>>,
    /// Connections the creator has been asked for but hasn't produced yet.
    /// A dedicated mutex rather than an atomic so that going negative (a
    /// logic bug: more completions than submissions) is observable and
    /// loud rather than silently wrapping.
    pending: Mutex<i64>,
    pub closed: AtomicBool,
    close_lock: Mutex<()>,
    creator: Creator,
}

impl<C: Connection + 'static> Inner<C> {
    pub fn new(options: PoolOptions<C>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            idle: IdleQueue::new(options.maxconn),
            in_use: Mutex::new(HashMap::new()),
            pending: Mutex::new(0),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            creator: Creator::spawn(weak.clone()),
            options,
        })
    }

    /// Best-effort count of idle + checked-out + in-flight connections.
    /// Each component is read under its own lock, so under concurrent
    /// activity this can be momentarily off by a few; callers only use it
    /// for scheduling decisions, never for correctness.
    pub fn live_count(&self) -> usize {
        let idle = self.idle.len();
        let in_use = self.in_use.lock().unwrap().len();
        let pending = (*self.pending.lock().unwrap()).max(0) as usize;
        idle + in_use + pending
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn inc_pending(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    pub fn dec_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending -= 1;
        if *pending < 0 {
            log::error!("pool pending-connection counter went negative ({pending})");
        }
    }

    /// Ask the background worker to create one more connection, if the
    /// pool isn't already at (or over) `maxconn`.
    pub fn ensure_capacity(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.live_count() < self.options.maxconn {
            self.inc_pending();
            self.creator.submit();
        }
    }

    /// Top the pool back up to `minconn` after a connection has left it
    /// abnormally (discarded, stale, or unhealthy on return).
    pub fn ensure_minconn(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        while self.live_count() < self.options.minconn {
            self.inc_pending();
            self.creator.submit();
            if self.live_count() >= self.options.maxconn {
                break;
            }
        }
    }

    pub fn close(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.close_lock.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.idle.close();
        self.creator.shutdown();

        let mut errors = Vec::new();
        for entry in self.idle.drain() {
            if let Err(err) = entry.conn.close() {
                errors.push(Box::new(err) as Box<dyn std::error::Error + Send + Sync>);
            }
        }

        // Connections currently checked out cannot be reached for a
        // synchronous close: ownership sits with whichever caller holds
        // them. They are closed lazily the next time `return_connection`
        // observes `closed == true` (see `PriorityPool::return_connection`).
        let outstanding = self.in_use.lock().unwrap().len();
        if outstanding > 0 {
            log::debug!("{outstanding} connection(s) still checked out at close(); they will be closed on return");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(CloseErrors(errors)))
        }
    }

    /// Implements the return algorithm from the pool design: remove from
    /// `in_use`, then in order (1) honor a pool-wide close, (2) drop an
    /// already-closed connection, (3) discard one left mid-transaction,
    /// (4) discard a `discard`-requested or stale one, (5) otherwise reset
    /// its session and put it back on the idle queue.
    pub fn release(&self, mut conn: C, discard: bool) -> Result<(), PoolError> {
        let created_on = self.in_use.lock().unwrap().remove(&conn.id());
        if created_on.is_none() {
            log::warn!(
                "connection {} returned but was not tracked as checked out (double return?)",
                conn.id()
            );
        }

        if self.closed() {
            if let Err(err) = conn.close() {
                log::warn!("error closing connection during pool close: {err}");
            }
            return Ok(());
        }

        if conn.is_closed() {
            self.ensure_minconn();
            return Ok(());
        }

        if conn.transaction_status() != TransactionStatus::Idle {
            log::warn!(
                "connection {} returned mid-transaction ({:?}); discarding",
                conn.id(),
                conn.transaction_status()
            );
            let _ = conn.rollback();
            let _ = conn.close();
            self.ensure_minconn();
            return Ok(());
        }

        let stale = match (self.options.stale_timeout, created_on) {
            (Some(max), Some(created_on)) => created_on.elapsed() >= max,
            _ => false,
        };
        if discard || stale {
            if let Err(err) = conn.close() {
                log::warn!("error closing discarded connection: {err}");
            }
            self.ensure_minconn();
            return Ok(());
        }

        match self.reset_session(&mut conn) {
            Ok(()) => {
                let created_on = created_on.unwrap_or_else(Instant::now);
                self.idle.put(PoolEntry { created_on, conn });
                Ok(())
            }
            Err(err) => {
                log::warn!("error resetting session on return, discarding connection: {err}");
                let _ = conn.close();
                self.ensure_minconn();
                Err(PoolError::Driver(err))
            }
        }
    }

    fn reset_session(&self, conn: &mut C) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        conn.set_session(&self.options.session_defaults)
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)?;
        conn.execute("DISCARD ALL", &[])
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(())
    }
}
