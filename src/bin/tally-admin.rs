use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tally::clock::{FixedPurgeChance, SystemClock};
use tally::config::{Config, StorageBackend};
use tally::counter::VisitCounter;
use tally::storage::file::{COUNTER_FILE, LOCK_FILE, VISIT_LOG_FILE};
use tally::storage;

#[derive(Parser)]
#[command(name = "tally-admin")]
#[command(about = "Visit counter diagnostics and maintenance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the counter value and visit log health
    Status,
    /// Remove visit records older than the window
    Purge,
    /// Overwrite the counter value
    Set {
        /// New counter value
        value: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage = storage::open_storage(&config.storage).await?;

    // Ensure files or tables exist
    storage.init().await?;

    let counter = VisitCounter::new(
        storage,
        Arc::new(SystemClock),
        Arc::new(FixedPurgeChance(false)),
        config.counter.window_secs,
    );

    match cli.command {
        Commands::Status => {
            let count = counter
                .current_count()
                .await
                .context("Failed to read visit counter")?;
            let stats = counter
                .visit_log_stats()
                .await
                .context("Failed to read visit log")?;

            println!("Backend:        {}", counter.storage().backend_name());
            if config.storage.backend == StorageBackend::File {
                let dir = Path::new(&config.storage.data_dir);
                println!("Counter file:   {}", dir.join(COUNTER_FILE).display());
                println!("Visit log:      {}", dir.join(VISIT_LOG_FILE).display());
                println!("Lock file:      {}", dir.join(LOCK_FILE).display());
            }
            println!("Dedup mode:     {:?}", config.counter.dedup_mode);
            println!("Visit count:    {}", count);
            println!("Window:         {}s", counter.window_secs());
            let cutoff = counter.now() - counter.window_secs();
            match DateTime::<Utc>::from_timestamp(cutoff, 0) {
                Some(cutoff) => println!("Live since:     {}", cutoff.to_rfc3339()),
                None => println!("Live since:     (out of range)"),
            }
            println!("Log entries:    {}", stats.total);
            println!("  live:         {}", stats.live);
            println!("  expired:      {}", stats.total - stats.live);
            if stats.malformed > 0 {
                println!("  malformed:    {} (dropped by the next purge)", stats.malformed);
            }
        }
        Commands::Purge => {
            let removed = counter.purge().await.context("Failed to purge visit log")?;
            println!("✓ Removed {} visit record(s)", removed);
        }
        Commands::Set { value } => {
            let previous = counter
                .current_count()
                .await
                .context("Failed to read visit counter")?;
            counter
                .set_count(value)
                .await
                .context("Failed to write visit counter")?;
            println!("✓ Visit count changed from {} to {}", previous, value);
        }
    }

    Ok(())
}
