//! Ledger database layer
//!
//! SQLite-backed store for the reconciled ledger. `schema` owns migrations,
//! `merge` formalizes the per-field merge policy shared by the live
//! reconciler and the backfill paths, `repo` is the repository API.

pub mod merge;
pub mod repo;
pub mod schema;

pub use repo::Database;
