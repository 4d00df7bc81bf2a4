//! Black-box scenario tests against the public API, using the in-memory
//! `MockConnection` in place of a live server.

use kirameki::migrate::{Direction, Migration, MigrationSet, MigratorOptions};
use kirameki::testing::{MockConnection, MockDatabase};
use kirameki::{MigrateError, Migrator};

fn migrations(widgets_extra_column: bool) -> Vec<Migration<MockConnection>> {
    let widgets_up = if widgets_extra_column {
        "CREATE TABLE widgets (id integer, extra text);"
    } else {
        "CREATE TABLE widgets (id integer);"
    };
    MigrationSet::new()
        .register(
            1,
            "create widgets",
            widgets_up,
            |_c| Ok(()),
            Some(|_c: &mut MockConnection| Ok(())),
        )
        .register(
            2,
            "create gadgets",
            "CREATE TABLE gadgets (id integer);",
            |_c| Ok(()),
            Some(|_c: &mut MockConnection| Ok(())),
        )
        .load()
        .unwrap()
}

#[test]
fn running_twice_is_idempotent() {
    let db = MockDatabase::new();
    let migrator = Migrator::new(migrations(false));
    let mut conn = MockConnection::with_database(db.clone());
    let mut noop = |_v, _ok| {};

    let first = migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();
    assert_eq!(first.direction, Direction::Forward);

    let second = migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();
    assert_eq!(second.direction, Direction::Unchanged);
    assert_eq!(db.history_snapshot().len(), 2);
}

#[test]
fn partial_rollback_leaves_earlier_versions_applied() {
    let db = MockDatabase::new();
    let migrator = Migrator::new(migrations(false));
    let mut conn = MockConnection::with_database(db.clone());
    let mut noop = |_v, _ok| {};

    migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();
    migrator.undo(&mut conn, Some(1), &MigratorOptions::default(), &mut noop).unwrap();

    let snapshot = db.history_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, 1);
}

#[test]
fn two_migrators_sharing_a_database_agree_once_applied() {
    let db = MockDatabase::new();
    let first = Migrator::new(migrations(false));
    let second = Migrator::new(migrations(false));
    let mut noop = |_v, _ok| {};

    let mut conn_a = MockConnection::with_database(db.clone());
    first.run(&mut conn_a, None, &MigratorOptions::default(), &mut noop).unwrap();

    // A second migrator reading the same database after the first commits
    // sees the fully-applied state and has nothing left to do.
    let mut conn_b = MockConnection::with_database(db.clone());
    let plan = second.run(&mut conn_b, None, &MigratorOptions::default(), &mut noop).unwrap();
    assert_eq!(plan.direction, Direction::Unchanged);
}

#[test]
fn checksum_mismatch_surfaces_as_a_migrate_error() {
    let db = MockDatabase::new();
    let migrator = Migrator::new(migrations(false));
    let mut conn = MockConnection::with_database(db.clone());
    let mut noop = |_v, _ok| {};
    migrator.run(&mut conn, None, &MigratorOptions::default(), &mut noop).unwrap();

    // A migrator loaded from source that has since changed no longer
    // agrees with the history table's recorded checksum.
    let tampered = Migrator::new(migrations(true));
    let err = tampered
        .run(&mut conn, None, &MigratorOptions::default(), &mut noop)
        .unwrap_err();
    assert!(matches!(err, MigrateError::StateIntegrity(1)));
}
