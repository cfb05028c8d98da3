//! One-time migration of the host's on-disk snapshot tree
//!
//! The host persists every entity as one JSON file:
//!
//! ```text
//! <root>/project/<projectID>.json
//! <root>/session/<projectID>/<sessionID>.json
//! <root>/message/<sessionID>/<messageID>.json
//! <root>/part/<messageID>/<partID>.json
//! ```
//!
//! Migration is insert-if-absent throughout, so re-running it over a ledger
//! that already holds live data only fills gaps. A missing snapshot root is
//! fatal; any single unreadable file is recorded and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::backfill::{ingest_session_messages, BackfillStats, WritePolicy};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{
    MessageInfo, MessageWithParts, PartEnvelope, ProjectRecord, SessionInfo, SessionRecord,
};

/// Read access to the host's snapshot tree.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open a snapshot tree. The root must exist.
    pub fn open(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::StorageNotFound(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse one snapshot file.
    pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// JSON files directly under `dir`, name-sorted. Missing directories are
    /// empty, not errors: a fresh host may never have written a given kind.
    fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn project_files(&self) -> Result<Vec<PathBuf>> {
        Self::json_files(&self.root.join("project"))
    }

    /// Session files across all project directories.
    pub fn session_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.root.join("session");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                files.extend(Self::json_files(&entry.path())?);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn message_files(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        Self::json_files(&self.root.join("message").join(session_id))
    }

    pub fn part_files(&self, message_id: &str) -> Result<Vec<PathBuf>> {
        Self::json_files(&self.root.join("part").join(message_id))
    }
}

/// Migrate the whole snapshot tree into the ledger.
pub fn migrate(db: &Database, store: &SnapshotStore) -> Result<BackfillStats> {
    migrate_with_progress(db, store, &mut |_, _, _| {})
}

/// Migrate with a per-session progress callback `(done, total, session_id)`.
pub fn migrate_with_progress(
    db: &Database,
    store: &SnapshotStore,
    progress: &mut dyn FnMut(usize, usize, &str),
) -> Result<BackfillStats> {
    let mut stats = BackfillStats::default();

    // Projects only contribute the worktree column on sessions
    let mut worktrees: HashMap<String, String> = HashMap::new();
    for file in store.project_files()? {
        match SnapshotStore::load::<ProjectRecord>(&file) {
            Ok(project) => {
                if let Some(worktree) = project.worktree {
                    worktrees.insert(project.id, worktree);
                }
            }
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable project");
            }
        }
    }

    let mut sessions = Vec::new();
    for file in store.session_files()? {
        match SnapshotStore::load::<SessionInfo>(&file) {
            Ok(info) => sessions.push(info),
            Err(e) => {
                stats.sessions.errors += 1;
                tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable session");
                db.log_error(
                    "migrate.session",
                    Some(&file.display().to_string()),
                    &e.to_string(),
                    None,
                );
            }
        }
    }
    stats.sessions.found = sessions.len() + stats.sessions.errors;

    // Main sessions first: a subagent's turn attribution needs the parent's
    // turns in the store
    sessions.sort_by_key(|info| (info.is_subagent(), info.time.created));

    let total = sessions.len();
    for (done, info) in sessions.iter().enumerate() {
        progress(done, total, &info.id);

        match migrate_session(db, store, info, &worktrees, &mut stats) {
            Ok(inserted) => {
                if inserted {
                    stats.sessions.processed += 1;
                } else {
                    stats.sessions.skipped += 1;
                }
            }
            Err(e) => {
                stats.sessions.errors += 1;
                tracing::warn!(session = %info.id, error = %e, "Migration failed for session");
                db.log_error("migrate.session", Some(&info.id), &e.to_string(), None);
            }
        }
    }
    progress(total, total, "");

    Ok(stats)
}

/// Migrate one session. Returns whether the session row itself was new.
fn migrate_session(
    db: &Database,
    store: &SnapshotStore,
    info: &SessionInfo,
    worktrees: &HashMap<String, String>,
    stats: &mut BackfillStats,
) -> Result<bool> {
    let worktree = info
        .project_id
        .as_ref()
        .and_then(|id| worktrees.get(id))
        .map(String::as_str);

    let inserted = db.insert_session_if_absent(&SessionRecord::from_info(info, worktree))?;

    let inherited_turn = match &info.parent_id {
        Some(parent_id) => db.latest_turn_at_or_before(parent_id, info.time.created)?,
        None => None,
    };

    let mut messages = Vec::new();
    for file in store.message_files(&info.id)? {
        let message: MessageInfo = match SnapshotStore::load(&file) {
            Ok(message) => message,
            Err(e) => {
                stats.messages.errors += 1;
                tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable message");
                db.log_error(
                    "migrate.message",
                    Some(&file.display().to_string()),
                    &e.to_string(),
                    None,
                );
                continue;
            }
        };

        let mut parts: Vec<PartEnvelope> = Vec::new();
        for part_file in store.part_files(message.id())? {
            match SnapshotStore::load(&part_file) {
                Ok(part) => parts.push(part),
                Err(e) => {
                    stats.parts.errors += 1;
                    tracing::warn!(file = %part_file.display(), error = %e, "Skipping unreadable part");
                    db.log_error(
                        "migrate.part",
                        Some(&part_file.display().to_string()),
                        &e.to_string(),
                        None,
                    );
                }
            }
        }

        messages.push(MessageWithParts {
            info: message,
            parts,
        });
    }

    ingest_session_messages(
        db,
        info,
        &mut messages,
        inherited_turn.as_deref(),
        WritePolicy::InsertIfAbsent,
        stats,
    )?;

    Ok(inserted)
}
