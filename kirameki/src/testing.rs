//! In-memory `Connection` test doubles.
//!
//! Stands in for a live Postgres server so pool, planner, and migrator
//! logic can be exercised deterministically without a database (ground
//! truth: `sqlx-core::mock`). Not part of the driver contract an embedder
//! implements against a real server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::connection::{Cell, Connection, ConnectionFactory, Param, Row, SessionSettings, TransactionStatus};
use crate::error::DriverError;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The error type `MockConnection` reports. `serialization_failure` drives
/// [`DriverError::is_serialization_failure`], which the migrator's retry
/// loop keys off of.
#[derive(Debug)]
pub struct MockError {
    pub message: String,
    pub serialization_failure: bool,
}

impl MockError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            serialization_failure: false,
        }
    }

    pub fn serialization_failure() -> Self {
        Self {
            message: "could not serialize access due to concurrent update".into(),
            serialization_failure: true,
        }
    }
}

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MockError {}

impl DriverError for MockError {
    fn is_serialization_failure(&self) -> bool {
        self.serialization_failure
    }
}

enum PendingWrite {
    Insert(i64, String),
    Delete(i64),
}

/// A shared backing store standing in for "the database" so several
/// `MockConnection`s opened in the same test observe the same
/// `__kirameki_history__` state and the same `LOCK TABLE` serialization.
#[derive(Default)]
pub struct MockDatabase {
    history: Mutex<BTreeMap<i64, (String, chrono::DateTime<chrono::Utc>)>>,
    lock_held: Mutex<bool>,
    lock_cv: Condvar,
    fail_next_commit: AtomicBool,
}

impl MockDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `commit()` across any connection sharing this database
    /// fails with a serialization failure, exactly once.
    pub fn fail_next_commit_with_serialization_failure(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn history_snapshot(&self) -> Vec<(i64, String)> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|(v, (s, _))| (*v, s.clone()))
            .collect()
    }

    fn acquire_lock(&self) {
        let mut held = self.lock_held.lock().unwrap();
        while *held {
            held = self.lock_cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn release_lock(&self) {
        let mut held = self.lock_held.lock().unwrap();
        *held = false;
        self.lock_cv.notify_one();
    }
}

/// A connection that interprets the small set of statements the pool and
/// migrator actually issue, rather than a real wire protocol.
pub struct MockConnection {
    id: u64,
    closed: bool,
    status: TransactionStatus,
    database: Option<Arc<MockDatabase>>,
    holding_lock: bool,
    pending: Vec<PendingWrite>,
    fail_close: bool,
    /// Tracks `BEGIN`/`COMMIT`/`ROLLBACK` framing the way a real driver
    /// would, so a caller that forgets to re-`BEGIN` after a rollback (e.g.
    /// on a retried migration) is caught instead of silently tolerated.
    in_transaction: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            closed: false,
            status: TransactionStatus::Idle,
            database: None,
            holding_lock: false,
            pending: Vec::new(),
            fail_close: false,
            in_transaction: false,
        }
    }

    /// Opens a connection against a shared [`MockDatabase`] instead of an
    /// isolated, private history table.
    pub fn with_database(database: Arc<MockDatabase>) -> Self {
        Self {
            database: Some(database),
            ..Self::new()
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_transaction_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    /// Simulates the server having already dropped the socket.
    pub fn mark_closed_by_server(&mut self) {
        self.closed = true;
    }

    /// A [`ConnectionFactory`] that produces fresh, independent
    /// connections with no shared history table. Suitable for pool tests
    /// that don't exercise the migrator.
    pub fn factory() -> ConnectionFactory<Self> {
        Box::new(|| Ok(MockConnection::new()))
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    type Error = MockError;

    fn id(&self) -> u64 {
        self.id
    }

    fn execute(&mut self, sql: &str, params: &[Param<'_>]) -> Result<u64, MockError> {
        let sql = sql.trim();

        if sql.starts_with("CREATE TABLE") {
            return Ok(0);
        }

        if sql.starts_with("LOCK TABLE") {
            if !self.in_transaction {
                return Err(MockError::new("LOCK TABLE can only be used in transaction blocks"));
            }
            if let Some(db) = &self.database {
                db.acquire_lock();
                self.holding_lock = true;
            }
            self.status = TransactionStatus::Active;
            return Ok(0);
        }

        if sql.starts_with("INSERT INTO __kirameki_history__") {
            if !self.in_transaction {
                return Err(MockError::new("INSERT outside a transaction block"));
            }
            let version = match params.first() {
                Some(Param::Int(v)) => *v,
                _ => return Err(MockError::new("expected an integer version parameter")),
            };
            let sha256 = match params.get(1) {
                Some(Param::Text(s)) => (*s).to_string(),
                _ => return Err(MockError::new("expected a text sha256 parameter")),
            };
            self.pending.push(PendingWrite::Insert(version, sha256));
            self.status = TransactionStatus::Active;
            return Ok(1);
        }

        if sql.starts_with("DELETE FROM __kirameki_history__") {
            if !self.in_transaction {
                return Err(MockError::new("DELETE outside a transaction block"));
            }
            let version = match params.first() {
                Some(Param::Int(v)) => *v,
                _ => return Err(MockError::new("expected an integer version parameter")),
            };
            self.pending.push(PendingWrite::Delete(version));
            self.status = TransactionStatus::Active;
            return Ok(1);
        }

        // Anything else (migration bodies, `DISCARD ALL`, ...) is treated
        // as an opaque, always-successful statement.
        Ok(0)
    }

    fn query(&mut self, sql: &str, _params: &[Param<'_>]) -> Result<Vec<Row>, MockError> {
        let sql = sql.trim();
        if sql.starts_with("SELECT version, sha256, applied_on FROM __kirameki_history__") {
            let Some(db) = &self.database else {
                return Ok(Vec::new());
            };
            let history = db.history.lock().unwrap();
            return Ok(history
                .iter()
                .map(|(v, (s, applied_on))| Row(vec![Cell::Int(*v), Cell::Text(s.clone()), Cell::Timestamp(*applied_on)]))
                .collect());
        }
        Ok(Vec::new())
    }

    fn set_session(&mut self, settings: &SessionSettings) -> Result<(), MockError> {
        match settings.autocommit {
            crate::connection::Setting::Set(true) => self.in_transaction = false,
            crate::connection::Setting::Set(false) => self.in_transaction = true,
            crate::connection::Setting::Keep => {}
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MockError> {
        let result = if let Some(db) = &self.database {
            if db.fail_next_commit.swap(false, Ordering::SeqCst) {
                self.pending.clear();
                Err(MockError::serialization_failure())
            } else {
                let mut history = db.history.lock().unwrap();
                for write in self.pending.drain(..) {
                    match write {
                        PendingWrite::Insert(v, s) => {
                            history.insert(v, (s, chrono::Utc::now()));
                        }
                        PendingWrite::Delete(v) => {
                            history.remove(&v);
                        }
                    }
                }
                Ok(())
            }
        } else {
            self.pending.clear();
            Ok(())
        };

        if self.holding_lock {
            self.database.as_ref().expect("holding_lock implies a database").release_lock();
            self.holding_lock = false;
        }
        self.status = TransactionStatus::Idle;
        self.in_transaction = false;
        result
    }

    fn rollback(&mut self) -> Result<(), MockError> {
        self.pending.clear();
        if self.holding_lock {
            self.database.as_ref().expect("holding_lock implies a database").release_lock();
            self.holding_lock = false;
        }
        self.status = TransactionStatus::Idle;
        self.in_transaction = false;
        Ok(())
    }

    fn close(self) -> Result<(), MockError> {
        if self.fail_close {
            return Err(MockError::new("simulated close failure"));
        }
        Ok(())
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
