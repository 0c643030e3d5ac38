use anyhow::Result;
use clap::ArgMatches;

use modbus_utility::cli::{build_cli, handle_subcommands, log_file};
use modbus_utility::utils::init_logging;

fn wants_debug(matches: &ArgMatches) -> bool {
    if matches.get_flag("verbose") {
        return true;
    }
    matches!(
        matches.subcommand(),
        Some(("slave", slave)) if matches!(
            slave.subcommand(),
            Some(("run", run)) if run.get_flag("show-debug")
        )
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = build_cli();
    let matches = cli.clone().get_matches();

    let default_level = if wants_debug(&matches) { "debug" } else { "info" };
    init_logging(default_level, log_file(&matches).as_deref())?;

    if !handle_subcommands(&matches).await? {
        cli.print_help()?;
        println!();
    }

    Ok(())
}
