//! TaskRelay - per-target execution queue for coding CLIs.

use clap::Parser;
use std::process::ExitCode;

use taskrelay::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Keep the guard alive so file logs are flushed on exit.
    let _guard = match taskrelay::logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
