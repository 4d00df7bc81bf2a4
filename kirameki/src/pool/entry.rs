use std::cmp::Ordering;
use std::time::Instant;

/// A pooled connection paired with the instant it was created.
///
/// Ordering is reversed so that placing these into a [`std::collections::BinaryHeap`]
/// (a max-heap) pops the *oldest* entry first — the priority-by-age scheme
/// described in the pool's design.
pub(crate) struct PoolEntry<C> {
    pub created_on: Instant,
    pub conn: C,
}

impl<C> PoolEntry<C> {
    pub fn new(conn: C) -> Self {
        Self {
            created_on: Instant::now(),
            conn,
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_on.elapsed()
    }
}

impl<C> PartialEq for PoolEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.created_on == other.created_on
    }
}

impl<C> Eq for PoolEntry<C> {}

impl<C> PartialOrd for PoolEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for PoolEntry<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.created_on.cmp(&self.created_on)
    }
}
