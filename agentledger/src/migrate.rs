//! agentledger-migrate - one-time migration of the host's snapshot tree
//!
//! Walks the host runtime's on-disk JSON snapshots (projects, sessions,
//! messages, parts) and inserts whatever the ledger does not already hold.
//! Safe to re-run: existing rows are skipped, never overwritten.

use std::path::PathBuf;

use agentledger_core::backfill::snapshot::{self, SnapshotStore};
use agentledger_core::{Config, Database};
use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "agentledger-migrate")]
#[command(about = "Migrate the host's on-disk snapshots into the ledger")]
#[command(version)]
struct Args {
    /// Snapshot storage root (default: $AGENTLEDGER_STORAGE or the host's
    /// per-user data directory)
    #[arg(long)]
    storage: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        agentledger_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("agentledger-migrate starting");

    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let storage_root = args.storage.unwrap_or_else(Config::storage_root);

    println!("Ledger:  {}", db_path.display());
    println!("Storage: {}", storage_root.display());

    let store = SnapshotStore::open(storage_root).context("snapshot storage not usable")?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} sessions {msg}")
            .context("invalid progress template")?,
    );

    let stats = snapshot::migrate_with_progress(&db, &store, &mut |done, total, session_id| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
        bar.set_message(session_id.to_string());
    })
    .context("migration failed")?;

    bar.finish_and_clear();

    println!("\nMigration complete:");
    print!("{}", stats);

    let errors = stats.sessions.errors + stats.messages.errors + stats.parts.errors;
    if errors > 0 {
        println!(
            "\n{} record(s) failed; details are in the plugin_errors table and the log at {}",
            errors,
            Config::log_path().display()
        );
    }

    tracing::info!("agentledger-migrate complete");
    Ok(())
}
