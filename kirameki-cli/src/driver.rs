//! A [`kirameki::Connection`] implementation over the synchronous
//! `postgres` crate: the driver-layer piece `kirameki` itself leaves out
//! (see its crate-level documentation).

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use kirameki::connection::{Cell, Connection, IsolationLevel, Param, Row, SessionSettings, Setting, TransactionStatus};
use kirameki::error::DriverError;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, NoTls};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps `postgres::Error`, classifying SQLSTATE `40001`/`40P01` as a
/// serialization failure so the migrator's retry loop can key off it.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct PgDriverError(#[from] postgres::Error);

impl DriverError for PgDriverError {
    fn is_serialization_failure(&self) -> bool {
        matches!(self.0.code().map(|c| c.code()), Some("40001") | Some("40P01"))
    }
}

/// A bound parameter, erased to a single concrete type so it can be
/// collected into a homogeneous `Vec<&dyn ToSql>` for `postgres::Client`.
enum BoundParam {
    Int(i64),
    Text(String),
}

impl ToSql for BoundParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            BoundParam::Int(v) => v.to_sql(ty, out),
            BoundParam::Text(s) => s.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        i64::accepts(ty) || String::accepts(ty)
    }

    to_sql_checked!();
}

fn bind(params: &[Param<'_>]) -> Vec<BoundParam> {
    params
        .iter()
        .map(|p| match p {
            Param::Int(v) => BoundParam::Int(*v),
            Param::Text(s) => BoundParam::Text((*s).to_string()),
        })
        .collect()
}

fn refs(bound: &[BoundParam]) -> Vec<&(dyn ToSql + Sync)> {
    bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// A single synchronous connection to a Postgres server.
pub struct PgConnection {
    id: u64,
    client: Client,
    in_transaction: bool,
    status: TransactionStatus,
}

impl PgConnection {
    pub fn connect(database_url: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let client = Client::connect(database_url, NoTls)?;
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            client,
            in_transaction: false,
            status: TransactionStatus::Idle,
        })
    }
}

fn row_from_pg(row: &postgres::Row) -> Row {
    let cells = row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| match col.type_().name() {
            "int2" | "int4" => Cell::Int(row.get::<_, i32>(i) as i64),
            "int8" => Cell::Int(row.get::<_, i64>(i)),
            "timestamp" | "timestamptz" => Cell::Timestamp(row.get::<_, chrono::DateTime<chrono::Utc>>(i)),
            "text" | "bpchar" | "varchar" => row
                .get::<_, Option<String>>(i)
                .map(Cell::Text)
                .unwrap_or(Cell::Null),
            _ => Cell::Null,
        })
        .collect();
    Row(cells)
}

impl Connection for PgConnection {
    type Error = PgDriverError;

    fn id(&self) -> u64 {
        self.id
    }

    fn execute(&mut self, sql: &str, params: &[Param<'_>]) -> Result<u64, Self::Error> {
        let bound = bind(params);
        match self.client.execute(sql, &refs(&bound)) {
            Ok(n) => Ok(n),
            Err(err) => {
                if self.in_transaction {
                    self.status = TransactionStatus::InError;
                }
                Err(err.into())
            }
        }
    }

    fn query(&mut self, sql: &str, params: &[Param<'_>]) -> Result<Vec<Row>, Self::Error> {
        let bound = bind(params);
        match self.client.query(sql, &refs(&bound)) {
            Ok(rows) => Ok(rows.iter().map(row_from_pg).collect()),
            Err(err) => {
                if self.in_transaction {
                    self.status = TransactionStatus::InError;
                }
                Err(err.into())
            }
        }
    }

    fn query_opt(&mut self, sql: &str, params: &[Param<'_>]) -> Result<Option<Row>, Self::Error> {
        let bound = bind(params);
        match self.client.query_opt(sql, &refs(&bound)) {
            Ok(row) => Ok(row.as_ref().map(row_from_pg)),
            Err(err) => {
                if self.in_transaction {
                    self.status = TransactionStatus::InError;
                }
                Err(err.into())
            }
        }
    }

    fn set_session(&mut self, settings: &SessionSettings) -> Result<(), Self::Error> {
        if let Setting::Set(autocommit) = settings.autocommit {
            if autocommit {
                if self.in_transaction {
                    self.client.batch_execute("COMMIT")?;
                    self.in_transaction = false;
                    self.status = TransactionStatus::Idle;
                }
            } else {
                let mut stmt = String::from("BEGIN");
                if let Setting::Set(level) = settings.isolation_level {
                    stmt.push_str(" ISOLATION LEVEL ");
                    stmt.push_str(&isolation_level_sql(level));
                }
                if let Setting::Set(readonly) = settings.readonly {
                    stmt.push_str(if readonly { " READ ONLY" } else { " READ WRITE" });
                }
                if let Setting::Set(deferrable) = settings.deferrable {
                    stmt.push_str(if deferrable { " DEFERRABLE" } else { " NOT DEFERRABLE" });
                }
                self.client.batch_execute(&stmt)?;
                self.in_transaction = true;
                self.status = TransactionStatus::Active;
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        if self.in_transaction {
            self.client.batch_execute("COMMIT")?;
            self.in_transaction = false;
        }
        self.status = TransactionStatus::Idle;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Self::Error> {
        if self.in_transaction {
            self.client.batch_execute("ROLLBACK")?;
            self.in_transaction = false;
        }
        self.status = TransactionStatus::Idle;
        Ok(())
    }

    fn close(self) -> Result<(), Self::Error> {
        drop(self.client);
        Ok(())
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn isolation_level_sql(level: IsolationLevel) -> &'static str {
    match level {
        IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
        IsolationLevel::ReadCommitted => "READ COMMITTED",
        IsolationLevel::RepeatableRead => "REPEATABLE READ",
        IsolationLevel::Serializable => "SERIALIZABLE",
    }
}
