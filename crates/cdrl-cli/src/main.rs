use std::path::PathBuf;

use anyhow::Result;
use cdrl_sync::RunSummary;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cdrl")]
#[command(about = "Call detail record loader: fills coverage gaps from emailed report exports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect missing weekdays and load the reports that cover them
    Sync,
    /// Reload the reports nearest the backfill anchors plus the newest one
    Backfill,
    /// Print coverage summary (read-only)
    Status,
    /// Load a report export from disk
    LoadCsv { path: PathBuf },
    /// Print the database schema
    ShowDdl,
    /// Apply the database schema
    Migrate,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} documents={}/{} records_written={} dropped={} duplicates={} dates_marked={}",
        summary.mode,
        summary.run_id,
        summary.documents_loaded,
        summary.documents_selected,
        summary.records_written,
        summary.records_dropped,
        summary.duplicates_removed,
        summary.dates_marked
    );
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync => print_summary(&cdrl_sync::run_sync_once_from_env().await?),
        Commands::Backfill => print_summary(&cdrl_sync::run_backfill_from_env().await?),
        Commands::Status => println!("{}", cdrl_sync::status_from_env().await?.render()),
        Commands::LoadCsv { path } => print_summary(&cdrl_sync::load_csv_from_env(&path).await?),
        Commands::ShowDdl => println!("{}", cdrl_storage::SCHEMA_DDL),
        Commands::Migrate => {
            cdrl_sync::migrate_from_env().await?;
            println!("schema applied");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = run(cli.command.unwrap_or(Commands::Sync)).await;
    if let Err(err) = &result {
        error!("{err:?}");
    }
    result
}
