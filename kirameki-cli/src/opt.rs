use clap::{Parser, Subcommand};
use kirameki::connection::{IsolationLevel, Setting};

/// Command-line front end for the `kirameki` migration engine.
#[derive(Parser, Debug)]
#[command(name = "kirameki", version, about)]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,

    /// Postgres connection string. Falls back to `DATABASE_URL` (loaded
    /// from `.env` via dotenvy) when omitted.
    #[arg(short = 'D', long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Directory of `m_<version>_<slug>.up.sql` / `...down.sql` files.
    #[arg(long, default_value = "migrations")]
    pub migrations: String,

    /// Print a `<version>: OK|FAIL` line per applied step to standard error.
    #[arg(long)]
    pub progress: bool,

    /// Transaction isolation level to hold while migrating, or "default"
    /// to leave the server's default untouched.
    #[arg(long, default_value = "default", value_parser = parse_isolation_level)]
    pub isolation_level: Setting<IsolationLevel>,

    /// Extra attempts after a serialization failure, re-planning from
    /// scratch each time.
    #[arg(long, default_value_t = 0)]
    pub num_retries: u32,

    /// Bypass checksum mismatches between the history table and the
    /// loaded migration set.
    #[arg(long)]
    pub force: bool,

    /// Compute and print the plan without applying it.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_isolation_level(raw: &str) -> Result<Setting<IsolationLevel>, String> {
    if raw.eq_ignore_ascii_case("default") {
        return Ok(Setting::Keep);
    }
    raw.parse::<IsolationLevel>().map(Setting::Set)
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations up to TARGET (default: the latest loaded
    /// version).
    Up { target: Option<i64> },

    /// Roll back to TARGET. Pass -1 to roll back everything.
    Down {
        #[arg(allow_hyphen_values = true)]
        target: i64,
    },
}
