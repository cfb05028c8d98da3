//! # agentledger-core
//!
//! Core library for agentledger - a reconciliation engine that maintains a
//! normalized SQLite ledger of AI coding agent activity.
//!
//! This library provides:
//! - Wire types for the host runtime's events and snapshot records
//! - Ledger storage layer with SQLite and an explicit merge policy
//! - Live event reconciliation with in-memory derived state
//! - Incremental backfill (host API) and one-time snapshot migration
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! The host runtime is the source of truth; the ledger converges on it from
//! two directions:
//! - **Live:** `EventReconciler` consumes the host's event stream and applies
//!   idempotent upserts as activity happens.
//! - **Batch:** `backfill` re-ingests history the tracker missed, merging
//!   under a fill-holes-only policy so live data always wins.
//!
//! ## Example
//!
//! ```rust,no_run
//! use agentledger_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the ledger
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use backfill::BackfillStats;
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use host::{EventSource, HostClient, HttpHostClient};
pub use reconcile::EventReconciler;
pub use types::*;

// Public modules
pub mod backfill;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod logging;
pub mod reconcile;
pub mod types;
