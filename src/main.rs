use std::process::ExitCode;

use clap::Parser;
use photobridge::cli;

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();
    cli::run(args)
}
