//! Molt executable.

mod cli;
mod subcommand;

use std::process;

fn main() {
    env_logger::init();
    let matches = cli::build_cli().get_matches();
    let result = match matches.subcommand() {
        Some((cli::CMD_TRANSFORM, matches)) => subcommand::transform::exec(matches),
        Some((cli::CMD_INSPECT, matches)) => subcommand::inspect::exec(matches),
        _ => unreachable!("subcommand is required"),
    };
    if let Err(error) = result {
        eprintln!("error: {error}");
        process::exit(1);
    }
}
