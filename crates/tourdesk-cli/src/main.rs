//! tourdesk - operator tool for the spreadsheet write-back queue

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;
use tourdesk_core::config::EngineConfig;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::sync::{run_cleanup, run_reset_stuck, run_retry_failed, run_status, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["tourdesk=info", "tourdesk_core=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let db_path = resolve_db_path(cli.db_path, &config);

    match cli.command {
        Commands::Sync { command } => match command {
            SyncCommands::Run { json } => run_sync(&config, &db_path, json).await?,
            SyncCommands::Status { json } => run_status(&db_path, json).await?,
            SyncCommands::RetryFailed { id } => run_retry_failed(&db_path, id.as_deref()).await?,
            SyncCommands::ResetStuck { minutes } => {
                let minutes = minutes.unwrap_or(config.sync.stuck_threshold_minutes);
                run_reset_stuck(&db_path, minutes).await?;
            }
            SyncCommands::Cleanup { days } => {
                let days = days.unwrap_or(config.sync.retention_days);
                run_cleanup(&db_path, days).await?;
            }
        },
    }

    Ok(())
}
