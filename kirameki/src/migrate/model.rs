//! The `Migration` entity and the history record it is checked against.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::connection::Connection;

/// The executable body of a migration step.
///
/// `Sql` is what the file loader produces (see [`super::source`]); `Function`
/// is what the registration-based loader produces, letting an embedder
/// supply arbitrary Rust logic instead of SQL text.
pub(crate) enum MigrationBody<C: Connection> {
    Sql(Arc<str>),
    Function(Arc<dyn Fn(&mut C) -> Result<(), C::Error> + Send + Sync>),
}

impl<C: Connection> Clone for MigrationBody<C> {
    fn clone(&self) -> Self {
        match self {
            MigrationBody::Sql(sql) => MigrationBody::Sql(Arc::clone(sql)),
            MigrationBody::Function(f) => MigrationBody::Function(Arc::clone(f)),
        }
    }
}

impl<C: Connection> MigrationBody<C> {
    fn run(&self, conn: &mut C) -> Result<(), C::Error> {
        match self {
            MigrationBody::Sql(sql) => conn.execute(sql, &[]).map(|_rows| ()),
            MigrationBody::Function(f) => f(conn),
        }
    }
}

impl<C: Connection> fmt::Debug for MigrationBody<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationBody::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            MigrationBody::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A single, immutable migration step, ordered strictly by `version`.
pub struct Migration<C: Connection> {
    pub version: i64,
    pub description: String,
    pub(crate) up: MigrationBody<C>,
    pub(crate) down: Option<MigrationBody<C>>,
    /// 64-character lowercase hex SHA-256 digest of the `up` source.
    pub sha256: String,
}

impl<C: Connection> Clone for Migration<C> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            description: self.description.clone(),
            up: self.up.clone(),
            down: self.down.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for Migration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("downable", &self.downable())
            .field("sha256", &self.sha256)
            .finish()
    }
}

impl<C: Connection> Migration<C> {
    pub(crate) fn sql(version: i64, description: String, up: Arc<str>, down: Option<Arc<str>>) -> Self {
        let sha256 = sha256_hex(up.as_bytes());
        Self {
            version,
            description,
            up: MigrationBody::Sql(up),
            down: down.map(MigrationBody::Sql),
            sha256,
        }
    }

    pub(crate) fn function(
        version: i64,
        description: String,
        up_source: &str,
        up: Arc<dyn Fn(&mut C) -> Result<(), C::Error> + Send + Sync>,
        down: Option<Arc<dyn Fn(&mut C) -> Result<(), C::Error> + Send + Sync>>,
    ) -> Self {
        Self {
            version,
            description,
            up: MigrationBody::Function(up),
            down: down.map(MigrationBody::Function),
            sha256: sha256_hex(up_source.as_bytes()),
        }
    }

    /// Whether this migration defines a `down` action.
    pub fn downable(&self) -> bool {
        self.down.is_some()
    }

    pub(crate) fn run_up(&self, conn: &mut C) -> Result<(), C::Error> {
        self.up.run(conn)
    }

    pub(crate) fn run_down(&self, conn: &mut C) -> Result<(), C::Error> {
        self.down
            .as_ref()
            .expect("planner only schedules down-steps for downable migrations")
            .run(conn)
    }
}

/// A row read back from `__kirameki_history__`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: i64,
    pub sha256: String,
    pub applied_on: chrono::DateTime<chrono::Utc>,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        let a = sha256_hex(b"create table t (id integer);");
        let b = sha256_hex(b"create table t (id integer);");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
