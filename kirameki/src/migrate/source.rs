//! Loaders that turn a migration source (a directory of SQL files, or an
//! explicit in-process registration) into an ordered [`Migration`] sequence.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::connection::Connection;
use crate::error::LoadFailure;

use super::model::Migration;

static FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^m_([0-9_]+)_([A-Za-z_][A-Za-z0-9_]*)\.(up|down)\.sql$").expect("valid regex")
});

/// Scans `dir` for `m_<version>_<slug>.up.sql` / `...down.sql` pairs.
///
/// Subdirectories and non-`.sql` files are reported as warnings via `log`
/// and otherwise ignored. A malformed file name, a `.down.sql` with no
/// matching `.up.sql`, or a version claimed by two different slugs is an
/// error; if any accumulate, [`LoadFailure`] is returned instead of a
/// partial migration set.
pub fn load_directory<C: Connection + 'static>(dir: &Path) -> Result<Vec<Migration<C>>, LoadFailure> {
    let mut errors: Vec<(String, String)> = Vec::new();

    struct Found {
        slug: String,
        up_path: Option<std::path::PathBuf>,
        down_path: Option<std::path::PathBuf>,
    }
    let mut by_version: HashMap<i64, Found> = HashMap::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            errors.push((dir.display().to_string(), format!("cannot read directory: {err}")));
            return Err(LoadFailure(errors));
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                errors.push((dir.display().to_string(), format!("error reading entry: {err}")));
                continue;
            }
        };

        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        let is_dir = match entry.file_type() {
            Ok(ft) => ft.is_dir(),
            Err(err) => {
                errors.push((name.clone(), format!("cannot stat: {err}")));
                continue;
            }
        };
        if is_dir {
            log::warn!("ignoring subdirectory in migration source: {name}");
            continue;
        }

        if !name.ends_with(".sql") {
            log::warn!("ignoring non-.sql file in migration source: {name}");
            continue;
        }

        let Some(captures) = FILE_PATTERN.captures(&name) else {
            errors.push((name.clone(), "malformed migration file name".into()));
            continue;
        };

        let raw_version = &captures[1];
        let slug = captures[2].to_string();
        let kind = &captures[3];

        let version: i64 = match raw_version.replace('_', "").parse() {
            Ok(v) => v,
            Err(err) => {
                errors.push((name.clone(), format!("invalid version {raw_version:?}: {err}")));
                continue;
            }
        };

        let found = by_version.entry(version).or_insert_with(|| Found {
            slug: slug.clone(),
            up_path: None,
            down_path: None,
        });

        if found.slug != slug {
            errors.push((
                name.clone(),
                format!(
                    "version {version} claimed by two different slugs: {:?} and {:?}",
                    found.slug, slug
                ),
            ));
            continue;
        }

        match kind {
            "up" => found.up_path = Some(path),
            "down" => found.down_path = Some(path),
            _ => unreachable!("regex only matches up|down"),
        }
    }

    let mut migrations = Vec::with_capacity(by_version.len());
    let mut versions: Vec<i64> = by_version.keys().copied().collect();
    versions.sort_unstable();

    for version in versions {
        let found = by_version.remove(&version).expect("key came from this map");
        let Some(up_path) = found.up_path else {
            errors.push((
                found.down_path.map(|p| p.display().to_string()).unwrap_or_default(),
                format!("version {version} has a .down.sql but no matching .up.sql"),
            ));
            continue;
        };

        let up_sql = match fs::read_to_string(&up_path) {
            Ok(sql) => sql,
            Err(err) => {
                errors.push((up_path.display().to_string(), format!("cannot read file: {err}")));
                continue;
            }
        };
        let down_sql = match &found.down_path {
            Some(p) => match fs::read_to_string(p) {
                Ok(sql) => Some(sql),
                Err(err) => {
                    errors.push((p.display().to_string(), format!("cannot read file: {err}")));
                    continue;
                }
            },
            None => None,
        };

        migrations.push(Migration::sql(
            version,
            found.slug.replace('_', " "),
            Arc::from(up_sql.into_boxed_str()),
            down_sql.map(|s| Arc::from(s.into_boxed_str())),
        ));
    }

    if errors.is_empty() {
        Ok(migrations)
    } else {
        Err(LoadFailure(errors))
    }
}

/// Builder for the registration-based loader: an embedder calls
/// [`MigrationSet::register`] once per migration (typically at program
/// init) instead of the crate scanning arbitrary files or dynamic modules,
/// since static binaries have no introspectable module list.
pub struct MigrationSet<C: Connection> {
    migrations: Vec<Migration<C>>,
    seen: HashSet<i64>,
    errors: Vec<(String, String)>,
}

impl<C: Connection + 'static> Default for MigrationSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection + 'static> MigrationSet<C> {
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
            seen: HashSet::new(),
            errors: Vec::new(),
        }
    }

    /// Registers a migration. `up_source` is hashed to produce the
    /// migration's checksum, exactly as the file loader hashes the `.up.sql`
    /// bytes; pass the SQL text if `up` just executes a string, or a stable
    /// identifier of the Rust logic otherwise (its own source text, a
    /// module path plus version, etc.).
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        mut self,
        version: i64,
        description: impl Into<String>,
        up_source: impl AsRef<str>,
        up: impl Fn(&mut C) -> Result<(), C::Error> + Send + Sync + 'static,
        down: Option<impl Fn(&mut C) -> Result<(), C::Error> + Send + Sync + 'static>,
    ) -> Self {
        if !self.seen.insert(version) {
            self.errors.push((
                format!("version {version}"),
                "duplicate version registered".into(),
            ));
            return self;
        }

        self.migrations.push(Migration::function(
            version,
            description.into(),
            up_source.as_ref(),
            Arc::new(up),
            down.map(|f| Arc::new(f) as Arc<dyn Fn(&mut C) -> Result<(), C::Error> + Send + Sync>),
        ));
        self
    }

    /// Consumes the builder, failing with [`LoadFailure`] if any
    /// registration was invalid (currently: duplicate versions).
    pub fn load(self) -> Result<Vec<Migration<C>>, LoadFailure> {
        if !self.errors.is_empty() {
            return Err(LoadFailure(self.errors));
        }
        let mut migrations = self.migrations;
        migrations.sort_by_key(|m| m.version);
        Ok(migrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;
    use std::io::Write;

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_ordered_pairs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "m_0001_create_users.up.sql", "CREATE TABLE users();");
        write(dir.path(), "m_0001_create_users.down.sql", "DROP TABLE users;");
        write(dir.path(), "m_0002_add_email.up.sql", "ALTER TABLE users ADD email text;");

        let migrations: Vec<Migration<MockConnection>> = load_directory(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert!(migrations[0].downable());
        assert_eq!(migrations[1].version, 2);
        assert!(!migrations[1].downable());
    }

    #[test]
    fn underscore_version_digits_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "m_1_0_0_release.up.sql", "SELECT 1;");
        let migrations: Vec<Migration<MockConnection>> = load_directory(dir.path()).unwrap();
        assert_eq!(migrations[0].version, 100);
    }

    #[test]
    fn missing_up_for_down_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "m_0001_oops.down.sql", "DROP TABLE users;");
        let result: Result<Vec<Migration<MockConnection>>, _> = load_directory(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn malformed_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "not_a_migration.sql", "SELECT 1;");
        let result: Result<Vec<Migration<MockConnection>>, _> = load_directory(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn subdirectories_and_non_sql_files_are_ignored_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), "README.md", "not sql");
        write(dir.path(), "m_0001_create.up.sql", "SELECT 1;");
        let migrations: Vec<Migration<MockConnection>> = load_directory(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
    }

    #[test]
    fn repeated_load_is_checksum_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "m_0001_create.up.sql", "CREATE TABLE t();");
        let a: Vec<Migration<MockConnection>> = load_directory(dir.path()).unwrap();
        let b: Vec<Migration<MockConnection>> = load_directory(dir.path()).unwrap();
        assert_eq!(a[0].sha256, b[0].sha256);
    }

    #[test]
    fn registration_rejects_duplicate_versions() {
        let set = MigrationSet::<MockConnection>::new()
            .register(1, "first", "up-1", |_c| Ok(()), None::<fn(&mut MockConnection) -> Result<(), _>>)
            .register(1, "dup", "up-1-again", |_c| Ok(()), None::<fn(&mut MockConnection) -> Result<(), _>>);
        assert!(set.load().is_err());
    }
}
