//! A priority-ordered connection pool and schema migration engine for
//! synchronous PostgreSQL drivers.
//!
//! This crate does not speak the wire protocol itself. It defines
//! [`connection::Connection`], the surface [`pool::PriorityPool`] and
//! [`migrate::Migrator`] call through, and an embedder supplies the impl
//! over their own driver (the synchronous `postgres` crate is the expected
//! pairing). [`testing::MockConnection`] stands in for a live server in
//! this crate's own test suite.
//!
//! - [`pool`] — a priority-ordered, thread-safe pool that checks out the
//!   oldest idle connection first, creates new ones on a background
//!   thread, and reinitializes itself after the owning process forks.
//! - [`migrate`] — loads an ordered set of migrations (from `.up.sql`/
//!   `.down.sql` files or registered directly), plans the steps needed to
//!   reach a target version, and applies them under an `ACCESS EXCLUSIVE`
//!   table lock with retry on serialization failure.
//! - [`framework`] — the seam a web framework integration plugs into to
//!   lend one pooled connection per request.

pub mod connection;
pub mod error;
pub mod framework;
pub mod migrate;
pub mod pool;

/// In-memory [`Connection`] test doubles, also usable from an embedder's
/// own test suite via the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::Connection;
pub use error::{MigrateError, PoolError};
pub use migrate::{Migrator, MigratorOptions};
pub use pool::{PoolOptions, PriorityPool};
