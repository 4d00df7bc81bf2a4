//! Tagged error variants for the pool and the migration engine.

use std::fmt;

/// Errors raised by [`crate::pool::PriorityPool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been closed, or was closed while the call was in flight.
    #[error("attempted to use a closed pool")]
    Closed,

    /// `get_connection` did not observe an idle entry before its deadline.
    #[error("timed out waiting for a connection")]
    Timeout,

    /// `fork_lock` could not be acquired within the fork-safety grace period.
    #[error("deadlocked while reinitializing pool state after fork")]
    Deadlocked,

    /// `return_connection` was called with a connection identity the pool
    /// never checked out (or already took back).
    #[error("attempted to return a foreign connection")]
    Foreign,

    /// One or more connections failed to close cleanly during `close()`.
    #[error("{0} connection(s) failed to close cleanly")]
    Close(CloseErrors),

    /// The connection factory failed to produce a connection.
    #[error("connection factory failed: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// `PoolOptions` were invalid (e.g. `minconn > maxconn`).
    #[error("invalid pool configuration: {0}")]
    Config(String),
}

/// An aggregate of errors collected while draining the pool on close.
#[derive(Debug, Default)]
pub struct CloseErrors(pub Vec<Box<dyn std::error::Error + Send + Sync>>);

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.len())
    }
}

/// Errors raised while loading, planning, or applying migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A loader accumulated one or more errors; see the attached report.
    #[error("failed to load migrations:\n{0}")]
    Load(#[from] LoadFailure),

    /// The planner could not compute a plan for the requested target.
    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    /// The history table references a version that no loaded migration has.
    #[error("migration {0} is recorded as applied but was not found in the loaded set")]
    UnknownMigration(i64),

    /// The history table's applied versions are not a prefix of the loaded,
    /// ordered version sequence (a hole exists before the recorded state).
    #[error("history table has a gap before version {0}; expected it to have been applied")]
    StateHole(i64),

    /// A recorded migration's checksum no longer matches the loaded source.
    #[error("checksum mismatch for version {0}; source has changed since it was applied")]
    StateIntegrity(i64),

    /// The underlying driver reported an error while executing SQL.
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Why the planner refused to produce a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    /// A backward step would have to revert a migration with no `down`.
    #[error("migration {0} is not downable")]
    NotDownable(i64),
    /// `target` is greater than `current` while rolling back.
    #[error("cannot roll back to version {target}, which is ahead of current version {current}")]
    TargetAheadOfCurrent { current: i64, target: i64 },
}

/// Errors accumulated by a [`crate::migrate::source::Loader`].
#[derive(Debug, Default)]
pub struct LoadFailure(pub Vec<(String, String)>);

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .0
            .iter()
            .map(|(name, msg)| format!("  {name}: {msg}"))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for LoadFailure {}

/// An error reported by a [`crate::connection::Connection`] implementation.
///
/// Implementors must be able to say whether a given failure is a
/// serialization failure, since the migrator's retry loop treats that case
/// specially.
pub trait DriverError: std::error::Error + Send + Sync + 'static {
    /// Whether this error represents a serialization failure (e.g.
    /// PostgreSQL's `40001`/`40P01` SQLSTATE classes) that a caller may
    /// retry by re-reading state and re-planning.
    fn is_serialization_failure(&self) -> bool;
}
