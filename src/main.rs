mod cli;
mod commands;
mod formatting;
mod settings;

use std::process::ExitCode;

use cli::Commands;
use commands::{run_clean_temp, run_probe, run_sweep_orphans};

#[tokio::main]
async fn main() -> ExitCode {
    run().await
}

async fn run() -> ExitCode {
    let args = cli::parse();
    settings::init_logging(args.verbose);

    match args.command {
        Commands::Probe { active_requests } => {
            run_probe(args.config, active_requests, args.format, args.output).await
        }
        Commands::SweepOrphans {
            dry_run,
            profile_marker,
        } => {
            run_sweep_orphans(
                args.config,
                dry_run,
                profile_marker,
                args.format,
                args.output,
            )
            .await
        }
        Commands::CleanTemp {
            aggressive,
            directories,
        } => {
            run_clean_temp(
                args.config,
                aggressive,
                directories,
                args.format,
                args.output,
            )
            .await
        }
    }
}
