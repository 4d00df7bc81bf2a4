//! A bounded, blocking, age-ordered queue of idle connections.
//!
//! `psycopg2`-derived pool implementations typically build this on top of
//! `queue.PriorityQueue` and signal shutdown by re-enqueuing a `None`
//! sentinel for every waiter to chase. Rust has no untyped sentinel value to
//! smuggle through a `BinaryHeap<PoolEntry<C>>`, so shutdown is tracked with
//! an explicit `closed` flag inside the same mutex as the heap: a waiter
//! that wakes up checks `closed` before looking at the heap, and `close()`
//! sets the flag and notifies every waiter at once. This reaches the same
//! observable behavior (every blocked `get` unblocks exactly once, with a
//! closed-pool error) without needing one sentinel per waiter.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PoolError;
use super::entry::PoolEntry;

struct State<C> {
    heap: BinaryHeap<PoolEntry<C>>,
    closed: bool,
}

pub(crate) struct IdleQueue<C> {
    capacity: usize,
    state: Mutex<State<C>>,
    not_empty: Condvar,
}

impl<C> IdleQueue<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Non-blocking enqueue, mirroring `queue.Queue.put_nowait`. Callers are
    /// expected to only enqueue when they know (or believe, under best-effort
    /// accounting) that capacity allows it; exceeding `capacity` is logged
    /// but not rejected, since a hard rejection here would leak the
    /// connection the caller is trying to hand back.
    pub fn put(&self, entry: PoolEntry<C>) {
        let mut state = self.state.lock().unwrap();
        if state.heap.len() >= self.capacity {
            log::warn!(
                "idle queue exceeding configured capacity ({} > {})",
                state.heap.len() + 1,
                self.capacity
            );
        }
        state.heap.push(entry);
        self.not_empty.notify_one();
    }

    /// Block until an idle entry is available, the deadline passes, or the
    /// queue is closed.
    pub fn get(&self, timeout: Option<Duration>) -> Result<PoolEntry<C>, PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(entry) = state.heap.pop() {
                return Ok(entry);
            }
            state = match deadline {
                None => self.not_empty.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    let (guard, result) =
                        self.not_empty.wait_timeout(state, deadline - now).unwrap();
                    if result.timed_out() && guard.heap.is_empty() && !guard.closed {
                        return Err(PoolError::Timeout);
                    }
                    guard
                }
            };
        }
    }

    /// Mark the queue closed and wake every blocked waiter.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
    }

    /// Remove and return every idle entry, oldest first. Used by `close()`
    /// to hand entries to the caller for driver-level closing.
    pub fn drain(&self) -> Vec<PoolEntry<C>> {
        let mut state = self.state.lock().unwrap();
        std::iter::from_fn(|| state.heap.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }
}
