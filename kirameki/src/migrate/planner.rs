//! Computes a deterministic forward or backward plan from a loaded
//! migration set and the history table's current state.

use crate::connection::Connection;
use crate::error::{MigrateError, PlanningError};

use super::model::{Migration, MigrationRecord};

/// Which way [`plan`] decided to move, or that nothing needs to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Unchanged,
}

/// The result of [`plan`]: an ordered sequence of versions to apply, and
/// the `(current, target)` pair it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    pub steps: Vec<i64>,
    pub direction: Direction,
    pub current: i64,
    pub target: i64,
}

/// `target = -1` means "roll back everything" / "unspecified for down".
pub const ROLL_BACK_ALL: i64 = -1;

/// Computes the steps needed to move from `state` to `target`.
///
/// `state` must be the history table's rows in `version ASC` order, exactly
/// as persisted. `force` bypasses the checksum check (but never the
/// unknown-version or history-hole checks, which indicate the history
/// table and the loaded migration set disagree about what has run, not
/// merely that source text changed).
pub fn plan<C: Connection>(
    migrations: &[Migration<C>],
    state: &[MigrationRecord],
    target: i64,
    force: bool,
) -> Result<PlanResult, MigrateError> {
    let loaded_versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
    let min_version = loaded_versions.first().copied().unwrap_or(ROLL_BACK_ALL);
    let max_version = loaded_versions.last().copied().unwrap_or(ROLL_BACK_ALL);

    let target = if target == ROLL_BACK_ALL {
        ROLL_BACK_ALL
    } else {
        target.clamp(min_version, max_version)
    };

    for (i, record) in state.iter().enumerate() {
        if !loaded_versions.contains(&record.version) {
            return Err(MigrateError::UnknownMigration(record.version));
        }
        match loaded_versions.get(i) {
            Some(&expected) if expected == record.version => {}
            Some(&expected) => return Err(MigrateError::StateHole(expected)),
            None => return Err(MigrateError::StateHole(record.version)),
        }

        let loaded = migrations
            .iter()
            .find(|m| m.version == record.version)
            .expect("checked above that this version is loaded");
        if !force && loaded.sha256 != record.sha256 {
            return Err(MigrateError::StateIntegrity(record.version));
        }
    }

    let current = state.last().map(|r| r.version).unwrap_or(ROLL_BACK_ALL);

    if current == target {
        return Ok(PlanResult {
            steps: Vec::new(),
            direction: Direction::Unchanged,
            current,
            target,
        });
    }

    if target > current {
        let steps = loaded_versions
            .into_iter()
            .filter(|&v| v > current && v <= target)
            .collect();
        return Ok(PlanResult {
            steps,
            direction: Direction::Forward,
            current,
            target,
        });
    }

    let mut steps: Vec<i64> = loaded_versions
        .into_iter()
        .filter(|&v| v > target && v <= current)
        .collect();
    steps.reverse();

    for &version in &steps {
        let migration = migrations
            .iter()
            .find(|m| m.version == version)
            .expect("step versions come from the loaded set");
        if !migration.downable() {
            return Err(MigrateError::Planning(PlanningError::NotDownable(version)));
        }
    }

    Ok(PlanResult {
        steps,
        direction: Direction::Backward,
        current,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;

    fn migration(version: i64, downable: bool) -> Migration<MockConnection> {
        let up: std::sync::Arc<dyn Fn(&mut MockConnection) -> Result<(), crate::testing::MockError> + Send + Sync> =
            std::sync::Arc::new(|_c| Ok(()));
        let down = downable.then(|| {
            std::sync::Arc::new(|_c: &mut MockConnection| Ok(()))
                as std::sync::Arc<dyn Fn(&mut MockConnection) -> Result<(), crate::testing::MockError> + Send + Sync>
        });
        Migration::function(version, format!("migration {version}"), &format!("up-{version}"), up, down)
    }

    fn record(version: i64, migration: &Migration<MockConnection>) -> MigrationRecord {
        MigrationRecord {
            version,
            sha256: migration.sha256.clone(),
            applied_on: chrono::Utc::now(),
        }
    }

    fn loaded(versions_with_downable: &[(i64, bool)]) -> Vec<Migration<MockConnection>> {
        versions_with_downable
            .iter()
            .map(|&(v, d)| migration(v, d))
            .collect()
    }

    #[test]
    fn unchanged_when_already_at_target() {
        let migrations = loaded(&(1..=8).map(|v| (v, true)).collect::<Vec<_>>());
        let state: Vec<_> = migrations.iter().map(|m| record(m.version, m)).collect();
        let result = plan(&migrations, &state, 8, false).unwrap();
        assert_eq!(result.direction, Direction::Unchanged);
        assert!(result.steps.is_empty());
        assert_eq!((result.current, result.target), (8, 8));
    }

    #[test]
    fn forward_plan_is_ascending() {
        let migrations = loaded(&(1..=8).map(|v| (v, true)).collect::<Vec<_>>());
        let state: Vec<_> = migrations[..6].iter().map(|m| record(m.version, m)).collect();
        let result = plan(&migrations, &state, 8, false).unwrap();
        assert_eq!(result.direction, Direction::Forward);
        assert_eq!(result.steps, vec![7, 8]);
        assert_eq!((result.current, result.target), (6, 8));
    }

    #[test]
    fn backward_plan_to_zero_is_descending() {
        let migrations = loaded(&(1..=8).map(|v| (v, true)).collect::<Vec<_>>());
        let state: Vec<_> = migrations.iter().map(|m| record(m.version, m)).collect();
        let result = plan(&migrations, &state, ROLL_BACK_ALL, false).unwrap();
        assert_eq!(result.direction, Direction::Backward);
        assert_eq!(result.steps, vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!((result.current, result.target), (8, -1));
    }

    #[test]
    fn checksum_mismatch_is_rejected_without_force() {
        let migrations = loaded(&[(1, true), (2, true), (3, true), (4, true)]);
        let mut state = vec![record(1, &migrations[0])];
        state.push(MigrationRecord {
            version: 2,
            sha256: "bad".repeat(22),
            applied_on: chrono::Utc::now(),
        });
        let err = plan(&migrations, &state, 4, false).unwrap_err();
        assert!(matches!(err, MigrateError::StateIntegrity(2)));
    }

    #[test]
    fn checksum_mismatch_is_allowed_with_force() {
        let migrations = loaded(&[(1, true), (2, true)]);
        let state = vec![
            record(1, &migrations[0]),
            MigrationRecord {
                version: 2,
                sha256: "bad".repeat(22),
                applied_on: chrono::Utc::now(),
            },
        ];
        let result = plan(&migrations, &state, 2, true).unwrap();
        assert_eq!(result.direction, Direction::Unchanged);
    }

    #[test]
    fn non_downable_step_blocks_rollback() {
        let migrations = loaded(&[(1, true), (2, true), (3, false)]);
        let state: Vec<_> = migrations.iter().map(|m| record(m.version, m)).collect();
        let err = plan(&migrations, &state, 1, false).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Planning(PlanningError::NotDownable(3))
        ));
    }

    #[test]
    fn unknown_applied_version_is_rejected() {
        let migrations = loaded(&[(1, true), (2, true)]);
        let state = vec![MigrationRecord {
            version: 99,
            sha256: "x".repeat(64),
            applied_on: chrono::Utc::now(),
        }];
        let err = plan(&migrations, &state, 2, false).unwrap_err();
        assert!(matches!(err, MigrateError::UnknownMigration(99)));
    }

    #[test]
    fn history_hole_is_rejected() {
        let migrations = loaded(&[(1, true), (2, true), (3, true)]);
        let state = vec![record(2, &migrations[1])];
        let err = plan(&migrations, &state, 3, false).unwrap_err();
        assert!(matches!(err, MigrateError::StateHole(1)));
    }
}
