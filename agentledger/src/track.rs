//! agentledger-track - live tracker for the host runtime's event stream
//!
//! Connects to the host's SSE endpoint and reconciles events into the ledger
//! until interrupted. At startup (and after every stream drop) an incremental
//! backfill catches the ledger up on sessions that changed while nothing was
//! listening.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/agentledger/ledger.db (override: $AGENTLEDGER_DB)
//! - Logs: $XDG_STATE_HOME/agentledger/agentledger.log
//! - Config: $XDG_CONFIG_HOME/agentledger/config.toml

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentledger_core::backfill::host::backfill_sessions;
use agentledger_core::reconcile::tracker::TrackerState;
use agentledger_core::{Config, Database, EventReconciler, EventSource, HttpHostClient};
use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "agentledger-track")]
#[command(about = "Track live agent activity into the ledger")]
#[command(version)]
struct Args {
    /// Skip the incremental backfill at startup
    #[arg(long)]
    no_backfill: bool,

    /// Seconds to wait before reconnecting after the stream drops
    #[arg(long, default_value = "2")]
    reconnect_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        agentledger_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("agentledger-track starting");

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening ledger");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    println!("Ledger: {}", db_path.display());
    println!("Host:   {}", config.host.resolved_base_url());

    let host = HttpHostClient::new(&config.host).context("failed to create host client")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            // Second Ctrl-C forces exit: the loop may be blocked on a read
            if !running.swap(false, Ordering::SeqCst) {
                std::process::exit(130);
            }
            eprintln!("\nShutting down (Ctrl-C again to force)...");
        })
        .context("failed to install signal handler")?;
    }

    let mut db = db;
    let mut state = TrackerState::new();

    while running.load(Ordering::SeqCst) {
        if !args.no_backfill {
            // The host may not be up yet; treat this like a dropped stream
            // and try again instead of exiting
            match backfill_sessions(&db, &host, state.clone()) {
                Ok((seeded, stats)) => {
                    state = seeded;
                    if stats.sessions.processed > 0 {
                        println!(
                            "Backfilled {} session(s) ({} skipped, {} errors)",
                            stats.sessions.processed, stats.sessions.skipped, stats.sessions.errors
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Incremental backfill failed");
                    eprintln!("Backfill failed ({}), retrying...", e);
                    std::thread::sleep(Duration::from_secs(args.reconnect_secs));
                    continue;
                }
            }
        }

        let mut source = match EventSource::connect(&config.host) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(error = %e, "Event stream connect failed");
                eprintln!("Host unreachable ({}), retrying...", e);
                std::thread::sleep(Duration::from_secs(args.reconnect_secs));
                continue;
            }
        };

        println!("Tracking (Ctrl-C to stop)");

        let mut reconciler = EventReconciler::with_state(db, &host, state);
        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match source.next_event() {
                Ok(Some(event)) => reconciler.handle(event),
                Ok(None) => {
                    tracing::warn!("Event stream closed by host");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event stream read failed");
                    break;
                }
            }
        }

        // Keep store and derived state across the reconnect; the next
        // backfill pass covers whatever the gap swallowed
        let (kept_db, kept_state) = reconciler.into_parts();
        db = kept_db;
        state = kept_state;

        if running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(args.reconnect_secs));
        }
    }

    tracing::info!("agentledger-track shutting down");
    Ok(())
}
