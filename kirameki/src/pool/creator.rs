//! The single background worker that turns "please create a connection"
//! requests into connections, off the calling thread.
//!
//! Mirrors the reference pool's single-worker `ThreadPoolExecutor`: there is
//! never more than one connection attempt in flight at a time, so a slow or
//! wedged server can only ever stall the creation of the *next* connection,
//! not the ones already idle or checked out.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use super::entry::PoolEntry;
use super::inner::Inner;
use crate::connection::Connection;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(8);

pub(crate) struct Creator {
    sender: Mutex<Option<crossbeam_channel::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Creator {
    pub fn spawn<C: Connection + 'static>(weak: Weak<Inner<C>>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<()>();
        let handle = thread::Builder::new()
            .name("kirameki-pool-creator".into())
            .spawn(move || worker_loop(rx, weak))
            .expect("failed to spawn pool creator thread");
        Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Ask the worker to create one connection. Best-effort: if the worker
    /// has already been shut down this is a no-op.
    pub fn submit(&self) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(());
        }
    }

    /// Disconnect the channel and join the worker thread. Blocks until the
    /// job currently in flight (if any) finishes.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<C: Connection + 'static>(rx: crossbeam_channel::Receiver<()>, weak: Weak<Inner<C>>) {
    while rx.recv().is_ok() {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        run_job(&inner);
    }
}

fn run_job<C: Connection + 'static>(inner: &Arc<Inner<C>>) {
    let mut last_err: Option<Box<dyn std::error::Error + Send + Sync>> = None;
    let mut outcome = None;

    for attempt in 0..MAX_ATTEMPTS {
        if inner.closed.load(Ordering::SeqCst) {
            inner.dec_pending();
            return;
        }
        match (inner.options.connection_factory)() {
            Ok(conn) => {
                outcome = Some(conn);
                break;
            }
            Err(err) => {
                log::warn!(
                    "connection attempt {}/{} failed: {err}",
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                last_err = Some(err);
                if attempt + 1 < MAX_ATTEMPTS {
                    thread::sleep(backoff_delay(attempt));
                }
            }
        }
    }

    inner.dec_pending();

    match outcome {
        Some(conn) => {
            if inner.closed.load(Ordering::SeqCst) {
                let _ = conn.close();
                return;
            }
            inner.idle.put(PoolEntry::new(conn));
        }
        None => {
            log::error!(
                "giving up on connection after {MAX_ATTEMPTS} attempts: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            );
            if inner.live_count() == 0 {
                log::error!("pool has no live or pending connections after a creation failure; closing it");
                let inner = Arc::clone(inner);
                thread::spawn(move || {
                    let _ = inner.close();
                });
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let scaled = BASE_DELAY.saturating_mul(1u32 << attempt.min(6));
    let capped = scaled.min(MAX_DELAY);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
    capped + jitter
}
