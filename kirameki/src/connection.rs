//! The driver contract PoolCore and the Migrator require of a connection.
//!
//! Opening sockets, authentication, the wire protocol, and cursor execution
//! are out of scope for this crate; `Connection` only names the surface the
//! pool and migrator call through. An embedder implements it over their own
//! driver (for example the synchronous `postgres` crate).

use std::fmt;

use crate::error::DriverError;

/// Where a connection's backing transaction currently stands.
///
/// Mirrors `psycopg2`'s `connection.info.transaction_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction is in progress; it is safe to reuse the connection.
    Idle,
    /// A transaction is active but no statement has failed.
    Active,
    /// A transaction is active and a statement inside it has errored.
    InError,
    /// The connection is in an unknown state (e.g. mid-async-operation).
    Unknown,
}

/// A value to bind into a parameterized statement.
#[derive(Debug, Clone)]
pub enum Param<'a> {
    Int(i64),
    Text(&'a str),
}

/// A single returned row, addressed positionally.
///
/// Kept deliberately minimal: the migrator only ever reads
/// `(version, sha256)` pairs out of the history table, so a small
/// dynamically-typed cell is enough and avoids pulling a full row/decode
/// framework into a crate whose driver layer is explicitly out of scope.
#[derive(Debug, Clone)]
pub struct Row(pub Vec<Cell>);

#[derive(Debug, Clone)]
pub enum Cell {
    Int(i64),
    Text(String),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Null,
}

impl Row {
    pub fn get_i64(&self, idx: usize) -> i64 {
        match self.0.get(idx) {
            Some(Cell::Int(v)) => *v,
            other => panic!("column {idx} is not an integer: {other:?}"),
        }
    }

    pub fn get_str(&self, idx: usize) -> &str {
        match self.0.get(idx) {
            Some(Cell::Text(v)) => v,
            other => panic!("column {idx} is not text: {other:?}"),
        }
    }

    pub fn get_timestamp(&self, idx: usize) -> chrono::DateTime<chrono::Utc> {
        match self.0.get(idx) {
            Some(Cell::Timestamp(v)) => *v,
            other => panic!("column {idx} is not a timestamp: {other:?}"),
        }
    }
}

/// A sentinel-aware session setting: `Keep` mirrors psycopg2's `"default"`
/// marker meaning "leave this parameter untouched", which is distinct from
/// explicitly setting it to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    Keep,
    Set(T),
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Setting::Keep
    }
}

/// The session parameters `PriorityPool` resets on return and the Migrator
/// sets before taking the history-table lock.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub autocommit: Setting<bool>,
    pub isolation_level: Setting<IsolationLevel>,
    pub readonly: Setting<bool>,
    pub deferrable: Setting<bool>,
}

/// The transaction isolation levels PostgreSQL supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::ReadUncommitted => "read uncommitted",
            IsolationLevel::ReadCommitted => "read committed",
            IsolationLevel::RepeatableRead => "repeatable read",
            IsolationLevel::Serializable => "serializable",
        })
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], " ").as_str() {
            "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unrecognized isolation level: {other:?}")),
        }
    }
}

/// The connection contract required by [`crate::pool::PriorityPool`] and
/// [`crate::migrate::migrator::Migrator`].
///
/// Implementors own a raw driver connection (socket + wire protocol) and
/// translate these calls into the driver's cursor-scoped operations.
pub trait Connection: Send {
    type Error: DriverError;

    /// Identity used by the pool's `in_use` map. Must be stable for the
    /// lifetime of the connection and distinct across live connections held
    /// by the same pool (a raw pointer or socket file descriptor works).
    fn id(&self) -> u64;

    /// Execute a statement that doesn't return rows (DDL, INSERT, DELETE,
    /// LOCK, ...). Returns the number of affected rows where applicable.
    fn execute(&mut self, sql: &str, params: &[Param<'_>]) -> Result<u64, Self::Error>;

    /// Execute a statement and fetch all resulting rows.
    fn query(&mut self, sql: &str, params: &[Param<'_>]) -> Result<Vec<Row>, Self::Error>;

    /// Execute a statement and fetch at most one row, mirroring the
    /// driver's `fetchone()`. The default implementation is built on
    /// [`Connection::query`]; implementors with a cheaper single-row path
    /// (e.g. a driver's own `query_opt`) may override it.
    fn query_opt(&mut self, sql: &str, params: &[Param<'_>]) -> Result<Option<Row>, Self::Error> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Apply session-level settings. Fields left at `Setting::Keep` are
    /// untouched, matching psycopg2's `"default"` sentinel.
    fn set_session(&mut self, settings: &SessionSettings) -> Result<(), Self::Error>;

    fn commit(&mut self) -> Result<(), Self::Error>;

    fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Close the underlying socket. Consumes the connection since it is no
    /// longer usable afterward.
    fn close(self) -> Result<(), Self::Error>;

    fn transaction_status(&self) -> TransactionStatus;

    /// Whether the driver has already observed the socket as closed (e.g.
    /// after the server dropped it).
    fn is_closed(&self) -> bool;
}

/// A zero-argument producer of connections, handed to the pool once at
/// construction time.
pub type ConnectionFactory<C> = Box<dyn Fn() -> Result<C, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;
