//! Orchestrates load → lock → plan → apply → commit, with retry on
//! serialization failure.

use std::panic::{self, AssertUnwindSafe};

use crate::connection::{Connection, IsolationLevel, Param, SessionSettings, Setting};
use crate::error::{DriverError, MigrateError, PlanningError};

use super::model::{Migration, MigrationRecord};
use super::planner::{self, Direction, PlanResult};

const HISTORY_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS __kirameki_history__ (\n  \
    version integer PRIMARY KEY,\n  \
    sha256 character(64) NOT NULL,\n  \
    applied_on timestamp DEFAULT (now() at time zone 'utc') NOT NULL\n\
)";

const LOCK_HISTORY_TABLE: &str = "LOCK TABLE __kirameki_history__ IN ACCESS EXCLUSIVE MODE";
const SELECT_HISTORY: &str = "SELECT version, sha256, applied_on FROM __kirameki_history__ ORDER BY version ASC";
const INSERT_HISTORY: &str = "INSERT INTO __kirameki_history__ (version, sha256) VALUES ($1, $2)";
const DELETE_HISTORY: &str = "DELETE FROM __kirameki_history__ WHERE version = $1";

/// Retry and session configuration for a single [`Migrator::run`] /
/// [`Migrator::undo`] call.
#[derive(Debug, Clone)]
pub struct MigratorOptions {
    pub isolation_level: Setting<IsolationLevel>,
    /// Extra attempts after a `SerializationFailure` commit, re-reading
    /// state and re-planning from scratch each time (see the design
    /// notes: no work is carried over between attempts).
    pub num_retries: u32,
    /// Bypass checksum mismatches in the history table.
    pub force: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            isolation_level: Setting::Keep,
            num_retries: 0,
            force: false,
        }
    }
}

/// Progress callback invoked once per applied step. Panics inside it are
/// caught and logged, never propagated into the migration transaction.
pub type ProgressCallback<'a> = dyn FnMut(i64, bool) + 'a;

/// An ordered, immutable set of migrations, ready to run against a
/// connection.
pub struct Migrator<C: Connection> {
    migrations: Vec<Migration<C>>,
}

impl<C: Connection> Migrator<C> {
    /// `migrations` must already be sorted by version ascending with no
    /// duplicates, as every [`super::source`] loader guarantees.
    pub fn new(migrations: Vec<Migration<C>>) -> Self {
        debug_assert!(
            migrations.windows(2).all(|w| w[0].version < w[1].version),
            "migrations must be sorted ascending with unique versions"
        );
        Self { migrations }
    }

    pub fn migrations(&self) -> &[Migration<C>] {
        &self.migrations
    }

    fn latest_version(&self) -> i64 {
        self.migrations.last().map(|m| m.version).unwrap_or(planner::ROLL_BACK_ALL)
    }

    fn by_version(&self, version: i64) -> &Migration<C> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
            .expect("planner only returns versions present in the loaded set")
    }

    /// Runs forward to `target` (default: latest).
    pub fn run(
        &self,
        conn: &mut C,
        target: Option<i64>,
        options: &MigratorOptions,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<PlanResult, MigrateError> {
        self.execute(conn, target.unwrap_or_else(|| self.latest_version()), options, progress, Intent::Up)
    }

    /// Rolls back to `target` (default: roll back everything).
    pub fn undo(
        &self,
        conn: &mut C,
        target: Option<i64>,
        options: &MigratorOptions,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<PlanResult, MigrateError> {
        self.execute(
            conn,
            target.unwrap_or(planner::ROLL_BACK_ALL),
            options,
            progress,
            Intent::Down,
        )
    }

    /// Computes (but does not apply) the plan `run` would execute, for
    /// `--dry-run`-style previews. Reads outside any lock, so a concurrent
    /// migrator could invalidate the preview before a real run applies it.
    pub fn plan_up(&self, conn: &mut C, target: Option<i64>, force: bool) -> Result<PlanResult, MigrateError> {
        self.preview(conn, target.unwrap_or_else(|| self.latest_version()), force, Intent::Up)
    }

    /// Computes (but does not apply) the plan `undo` would execute.
    pub fn plan_down(&self, conn: &mut C, target: Option<i64>, force: bool) -> Result<PlanResult, MigrateError> {
        self.preview(conn, target.unwrap_or(planner::ROLL_BACK_ALL), force, Intent::Down)
    }

    fn preview(&self, conn: &mut C, target: i64, force: bool, intent: Intent) -> Result<PlanResult, MigrateError> {
        ensure_history_table(conn)?;
        conn.set_session(&SessionSettings {
            autocommit: Setting::Set(true),
            ..SessionSettings::default()
        })
        .map_err(driver_err)?;
        let state = read_history(conn)?;
        let plan = planner::plan(&self.migrations, &state, target, force)?;
        if intent == Intent::Down && plan.direction == Direction::Forward {
            return Err(MigrateError::Planning(PlanningError::TargetAheadOfCurrent {
                current: plan.current,
                target: plan.target,
            }));
        }
        Ok(plan)
    }

    fn execute(
        &self,
        conn: &mut C,
        target: i64,
        options: &MigratorOptions,
        progress: &mut ProgressCallback<'_>,
        intent: Intent,
    ) -> Result<PlanResult, MigrateError> {
        ensure_history_table(conn)?;

        let mut retries_left = options.num_retries;

        loop {
            // Re-issued every iteration: a prior iteration's rollback (on
            // serialization failure) ends that transaction, and the driver
            // is not assumed to auto-begin a new one in non-autocommit mode
            // the way psycopg2 does. Without this, a retry would run the
            // lock and the migration steps in autocommit.
            conn.set_session(&SessionSettings {
                autocommit: Setting::Set(false),
                isolation_level: options.isolation_level,
                ..SessionSettings::default()
            })
            .map_err(driver_err)?;

            conn.execute(LOCK_HISTORY_TABLE, &[]).map_err(driver_err)?;
            let state = read_history(conn)?;

            let plan = match planner::plan(&self.migrations, &state, target, options.force) {
                Ok(plan) => plan,
                Err(err) => {
                    let _ = conn.rollback();
                    return Err(err);
                }
            };

            if intent == Intent::Down && plan.direction == Direction::Forward {
                let _ = conn.rollback();
                return Err(MigrateError::Planning(PlanningError::TargetAheadOfCurrent {
                    current: plan.current,
                    target: plan.target,
                }));
            }

            if plan.direction == Direction::Unchanged {
                conn.commit().map_err(driver_err)?;
                return Ok(plan);
            }

            let mut last_version = plan.current;
            let mut failure: Option<MigrateError> = None;

            for &version in &plan.steps {
                last_version = version;
                let migration = self.by_version(version);

                let step_result = match plan.direction {
                    Direction::Forward => migration.run_up(conn),
                    Direction::Backward => migration.run_down(conn),
                    Direction::Unchanged => unreachable!("handled above"),
                };

                if let Err(err) = step_result {
                    failure = Some(driver_err(err));
                    break;
                }

                let history_result = match plan.direction {
                    Direction::Forward => {
                        conn.execute(INSERT_HISTORY, &[Param::Int(version), Param::Text(&migration.sha256)])
                    }
                    Direction::Backward => conn.execute(DELETE_HISTORY, &[Param::Int(version)]),
                    Direction::Unchanged => unreachable!("handled above"),
                };

                if let Err(err) = history_result {
                    failure = Some(driver_err(err));
                    break;
                }

                call_progress(progress, version, true);
            }

            if let Some(err) = failure {
                call_progress(progress, last_version, false);
                let _ = conn.rollback();
                return Err(err);
            }

            match conn.commit() {
                Ok(()) => return Ok(plan),
                Err(err) if err.is_serialization_failure() => {
                    log::warn!("serialization failure committing migration plan, retrying: {err}");
                    let _ = conn.rollback();
                    if retries_left == 0 {
                        return Err(driver_err(err));
                    }
                    retries_left -= 1;
                    continue;
                }
                Err(err) => {
                    call_progress(progress, last_version, false);
                    let _ = conn.rollback();
                    return Err(driver_err(err));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Up,
    Down,
}

fn ensure_history_table<C: Connection>(conn: &mut C) -> Result<(), MigrateError> {
    conn.set_session(&SessionSettings {
        autocommit: Setting::Set(true),
        ..SessionSettings::default()
    })
    .map_err(driver_err)?;
    conn.execute(HISTORY_TABLE_DDL, &[]).map_err(driver_err)?;
    Ok(())
}

fn read_history<C: Connection>(conn: &mut C) -> Result<Vec<MigrationRecord>, MigrateError> {
    let rows = conn.query(SELECT_HISTORY, &[]).map_err(driver_err)?;
    Ok(rows
        .into_iter()
        .map(|row| MigrationRecord {
            version: row.get_i64(0),
            sha256: row.get_str(1).to_string(),
            applied_on: row.get_timestamp(2),
        })
        .collect())
}

fn driver_err<E: DriverError>(err: E) -> MigrateError {
    MigrateError::Driver(Box::new(err))
}

fn call_progress(progress: &mut ProgressCallback<'_>, version: i64, success: bool) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| progress(version, success)));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::error!("progress callback panicked: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, MockDatabase};
    use std::sync::Arc;

    fn sql_migrations() -> Vec<Migration<MockConnection>> {
        vec![
            Migration::sql(1, "create users".into(), Arc::from("CREATE TABLE users();"), Some(Arc::from("DROP TABLE users;"))),
            Migration::sql(2, "add email".into(), Arc::from("ALTER TABLE users ADD email text;"), Some(Arc::from("ALTER TABLE users DROP email;"))),
            Migration::sql(3, "seed".into(), Arc::from("INSERT INTO users DEFAULT VALUES;"), None),
        ]
    }

    #[test]
    fn run_applies_all_pending_forward() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db.clone());
        let mut seen = Vec::new();
        let mut progress = |v, ok| seen.push((v, ok));

        let plan = migrator
            .run(&mut conn, None, &MigratorOptions::default(), &mut progress)
            .unwrap();

        assert_eq!(plan.direction, Direction::Forward);
        assert_eq!(plan.steps, vec![1, 2, 3]);
        assert_eq!(seen, vec![(1, true), (2, true), (3, true)]);
        assert_eq!(db.history_snapshot().len(), 3);
    }

    #[test]
    fn undo_then_redo_round_trips_to_empty_history() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations().into_iter().filter(|m| m.downable()).collect());
        let mut conn = MockConnection::with_database(db.clone());
        let mut noop = |_v, _ok| {};

        migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();
        assert!(!db.history_snapshot().is_empty());

        migrator.undo(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();
        assert!(db.history_snapshot().is_empty());
    }

    #[test]
    fn undo_past_current_is_a_planning_error() {
        let db = MockDatabase::new();
        let migrations: Vec<_> = sql_migrations().into_iter().filter(|m| m.downable()).collect();
        let migrator = Migrator::new(migrations);
        let mut conn = MockConnection::with_database(db);
        let mut noop = |_v, _ok| {};

        // Nothing applied yet (current = -1); asking to roll back to a
        // higher target than current is nonsensical for `down`.
        let err = migrator
            .undo(&mut conn, Some(1), &MigratorOptions::default(), &mut noop)
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Planning(PlanningError::TargetAheadOfCurrent { .. })
        ));
    }

    #[test]
    fn serialization_failure_is_retried() {
        // `MockConnection` enforces BEGIN/COMMIT/ROLLBACK framing like a
        // real driver: the retry attempt's `LOCK TABLE` only succeeds if
        // the migrator re-established a transaction after the rollback
        // from the first attempt's serialization failure.
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db.clone());
        let mut noop = |_v, _ok| {};

        db.fail_next_commit_with_serialization_failure();
        let options = MigratorOptions {
            num_retries: 1,
            ..MigratorOptions::default()
        };
        let plan = migrator.run(&mut conn, None, &options, &mut noop).unwrap();
        assert_eq!(plan.steps, vec![1, 2, 3]);
        assert_eq!(db.history_snapshot().len(), 3);
    }

    #[test]
    fn serialization_failure_without_retries_surfaces() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db.clone());
        let mut noop = |_v, _ok| {};

        db.fail_next_commit_with_serialization_failure();
        let err = migrator
            .run(&mut conn, None, &MigratorOptions::default(), &mut noop)
            .unwrap_err();
        assert!(matches!(err, MigrateError::Driver(_)));
    }

    #[test]
    fn panicking_progress_callback_does_not_abort_the_run() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db);
        let mut progress = |_v: i64, _ok: bool| panic!("boom");

        let plan = migrator
            .run(&mut conn, None, &MigratorOptions::default(), &mut progress)
            .unwrap();
        assert_eq!(plan.steps, vec![1, 2, 3]);
    }

    #[test]
    fn plan_up_previews_without_applying() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db.clone());

        let preview = migrator.plan_up(&mut conn, None, false).unwrap();
        assert_eq!(preview.steps, vec![1, 2, 3]);
        assert!(db.history_snapshot().is_empty(), "plan_up must not apply anything");
    }

    #[test]
    fn unchanged_plan_commits_without_calling_progress() {
        let db = MockDatabase::new();
        let migrator = Migrator::new(sql_migrations());
        let mut conn = MockConnection::with_database(db.clone());
        let mut noop = |_v, _ok| {};
        migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();

        let mut calls = 0;
        let mut progress = |_v, _ok| calls += 1;
        let plan = migrator.run(&mut conn, None, &MigratorOptions::default(), &mut progress).unwrap();
        assert_eq!(plan.direction, Direction::Unchanged);
        assert_eq!(calls, 0);
    }
}
