use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use console::style;
use kirameki::error::MigrateError;
use kirameki::migrate::{load_directory, MigratorOptions};
use kirameki::Migrator;

mod driver;
mod opt;

use driver::PgConnection;
use opt::{Command, Opt};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let opt = Opt::parse();

    let level = match opt.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    match run(&opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", style("error:").bold().red());
            match err.downcast_ref::<MigrateError>() {
                Some(MigrateError::Planning(_)) | Some(MigrateError::StateIntegrity(_)) => ExitCode::from(1),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(opt: &Opt) -> anyhow::Result<()> {
    let migrations = load_directory(Path::new(&opt.migrations))
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let migrator = Migrator::new(migrations);

    let mut conn = PgConnection::connect(&opt.database_url).map_err(|err| anyhow::anyhow!("{err}"))?;

    let options = MigratorOptions {
        isolation_level: opt.isolation_level,
        num_retries: opt.num_retries,
        force: opt.force,
    };

    let mut progress = |version: i64, ok: bool| {
        if opt.progress {
            let status = if ok { style("OK").green() } else { style("FAIL").red() };
            eprintln!("{version}: {status}");
        }
    };

    let plan = match &opt.command {
        Command::Up { target } => {
            if opt.dry_run {
                migrator.plan_up(&mut conn, *target, opt.force)?
            } else {
                migrator.run(&mut conn, *target, &options, &mut progress)?
            }
        }
        Command::Down { target } => {
            if opt.dry_run {
                migrator.plan_down(&mut conn, Some(*target), opt.force)?
            } else {
                migrator.undo(&mut conn, Some(*target), &options, &mut progress)?
            }
        }
    };

    if opt.dry_run {
        println!("{}: {:?}, steps = {:?}", style("plan").cyan(), plan.direction, plan.steps);
    }

    Ok(())
}
