use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally_sync::{compute_next_run_time, SyncConfig, SyncEngine, SyncScheduler};

#[derive(Debug, Parser)]
#[command(name = "tally")]
#[command(about = "Reconciles externally tracked coding time with posts and projects")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one attribution sync now and print the summary.
    Sync,
    /// Arm the half-hour schedule and run until interrupted.
    Schedule,
    /// Print the next half-hour-aligned run boundary.
    NextRun,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = SyncEngine::from_config(&config).await?;
            let summary = engine.run_once().await?;
            println!(
                "sync complete: run_id={} posts_seen={} posts_skipped={} posts_synced={} projects_synced={} fetch_failures={}",
                summary.run_id,
                summary.posts_seen,
                summary.posts_skipped,
                summary.posts_synced,
                summary.projects_synced,
                summary.fetch_failures,
            );
        }
        Commands::Schedule => {
            let engine = Arc::new(SyncEngine::from_config(&config).await?);
            let scheduler = SyncScheduler::new(engine);
            scheduler.start().await?;
            if let Some(next) = scheduler.next_run_time().await {
                info!(%next, "schedule armed; waiting for ctrl-c");
            }
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await;
        }
        Commands::NextRun => {
            println!("{}", compute_next_run_time(chrono::Utc::now()));
        }
    }

    Ok(())
}
