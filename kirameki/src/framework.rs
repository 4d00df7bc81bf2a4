//! A framework-agnostic seam for lending one pooled connection per logical
//! request.
//!
//! Modeled after the original's Flask extension (`PooledDatabase`, which
//! stashed a connection on `flask.g` and returned it in a
//! `teardown_appcontext` hook) but expressed as a trait contract rather
//! than a binding to one specific framework — none of the grounding corpus
//! commits to a single web framework, and the crate's non-goals exclude
//! framework glue as a shipped deliverable. An embedder plugs their
//! framework's request-lifecycle hooks into [`RequestScope`] and
//! [`LentConnections`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::error::PoolError;
use crate::pool::{PoolConnection, PriorityPool};

/// A checked-out connection shared by every call to [`RequestScope::connection`]
/// within the same scope. Returns to the originating pool once the last
/// clone is dropped (normally when [`LentConnections::release`] drops the
/// map's own reference at the end of the request).
pub type ScopedConnection<C> = Arc<Mutex<PoolConnection<C>>>;

/// Something that can name the logical request it is running in, and
/// lend out (at most) one pooled connection for that request's lifetime.
pub trait RequestScope {
    type ScopeId: Eq + Hash + Clone;
    type Connection: Connection + 'static;

    /// A stable identifier for the current logical request, e.g. a
    /// task-local request id threaded through by the embedding framework.
    fn scope_id(&self) -> Self::ScopeId;

    /// Returns this scope's connection, checking one out from `pool` on
    /// the first call and memoizing it in `lent` for subsequent calls
    /// within the same scope.
    fn connection(
        &self,
        pool: &PriorityPool<Self::Connection>,
        lent: &LentConnections<Self::ScopeId, Self::Connection>,
    ) -> Result<ScopedConnection<Self::Connection>, PoolError> {
        lent.checkout(self.scope_id(), pool)
    }
}

/// A thread-safe memo table ensuring at most one pool checkout per scope
/// id.
pub struct LentConnections<K: Eq + Hash + Clone, C: Connection + 'static> {
    slots: Mutex<HashMap<K, ScopedConnection<C>>>,
}

impl<K: Eq + Hash + Clone, C: Connection + 'static> LentConnections<K, C> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the scope's connection, checking one out from `pool` if
    /// this is the first call for `scope`.
    pub fn checkout(&self, scope: K, pool: &PriorityPool<C>) -> Result<ScopedConnection<C>, PoolError> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(existing) = slots.get(&scope) {
            return Ok(Arc::clone(existing));
        }
        let conn = pool.get_connection(None)?;
        let scoped = Arc::new(Mutex::new(conn));
        slots.insert(scope, Arc::clone(&scoped));
        Ok(scoped)
    }

    /// Ends the scope. If no other clone of the [`ScopedConnection`] is
    /// held elsewhere, dropping this map's reference is what returns the
    /// connection to the pool — the Rust analogue of a
    /// `teardown_appcontext`/`after_request` hook.
    pub fn release(&self, scope: &K) {
        self.slots.lock().unwrap().remove(scope);
    }

    /// Number of scopes currently holding a lent connection. Observational,
    /// primarily useful in tests and diagnostics.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, C: Connection + 'static> Default for LentConnections<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolOptions;
    use crate::testing::MockConnection;
    use std::time::Duration;

    struct FakeRequest(u64);

    impl RequestScope for FakeRequest {
        type ScopeId = u64;
        type Connection = MockConnection;

        fn scope_id(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn repeat_calls_within_a_scope_share_the_connection() {
        let pool = PriorityPool::new(PoolOptions::new(MockConnection::factory()).minconn(1).maxconn(2)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let lent = LentConnections::new();
        let request = FakeRequest(1);

        let a = request.connection(&pool, &lent).unwrap();
        let b = request.connection(&pool, &lent).unwrap();
        assert_eq!(a.lock().unwrap().id(), b.lock().unwrap().id());
        assert_eq!(lent.len(), 1);

        lent.release(&request.scope_id());
        assert!(lent.is_empty());
    }

    #[test]
    fn different_scopes_get_different_connections() {
        let pool = PriorityPool::new(PoolOptions::new(MockConnection::factory()).minconn(2).maxconn(2)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let lent = LentConnections::new();

        let a = FakeRequest(1).connection(&pool, &lent).unwrap();
        let b = FakeRequest(2).connection(&pool, &lent).unwrap();
        assert_ne!(a.lock().unwrap().id(), b.lock().unwrap().id());
    }
}
