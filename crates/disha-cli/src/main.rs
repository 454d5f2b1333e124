//! The `disha` binary entry point.

use anyhow::Result;
use clap::Parser;

use disha_cli::{Cli, Commands};
use disha_core::observability::{LogFormat, init_logging};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    match cli.command {
        Commands::Run(args) => disha_cli::commands::run::execute(&args, &cli.database),
        Commands::Stages => {
            disha_cli::commands::stages::execute();
            Ok(())
        }
    }
}
