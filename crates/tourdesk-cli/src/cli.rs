use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tourdesk")]
#[command(about = "Inspect and drive the tourdesk spreadsheet write-back queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Ledger database path (overrides TOURDESK_DATABASE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spreadsheet write-back queue operations
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Drain pending tasks into the spreadsheet once
    Run {
        /// Output the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue counts, recent failures and recent audit entries
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Return FAILED tasks to PENDING with a fresh retry budget
    RetryFailed {
        /// Only retry this task
        #[arg(long, value_name = "TASK_ID")]
        id: Option<String>,
    },
    /// Return claims older than the threshold to PENDING
    ResetStuck {
        /// Claim age in minutes (defaults to SYNC_STUCK_THRESHOLD_MINUTES)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1440))]
        minutes: Option<u32>,
    },
    /// Delete COMPLETED tasks older than the retention window
    Cleanup {
        /// Retention in days (defaults to SYNC_RETENTION_DAYS)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=365))]
        days: Option<u32>,
    },
}
