//! Loading, planning, and applying schema migrations.
//!
//! [`source::load_directory`] and [`source::MigrationSet`] produce an
//! ordered [`Migration`] sequence; [`planner::plan`] computes the forward
//! or backward steps needed to reach a target version given the history
//! table's current state; [`Migrator`] orchestrates the two against a
//! connection, serializing concurrent actors with an `ACCESS EXCLUSIVE`
//! table lock and retrying on serialization failure.

mod migrator;
mod model;
mod planner;
mod source;

pub use migrator::{Migrator, MigratorOptions, ProgressCallback};
pub use model::{Migration, MigrationRecord};
pub use planner::{plan, Direction, PlanResult, ROLL_BACK_ALL};
pub use source::{load_directory, MigrationSet};

/// Table the migrator persists applied migration history to. Bit-exact
/// across this crate; do not rename without a corresponding migration of
/// the history table itself.
pub const HISTORY_TABLE_NAME: &str = "__kirameki_history__";
