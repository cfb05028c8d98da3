//! Incremental backfill over the host's query API
//!
//! Run at tracker startup: compares the host's session list against the
//! ledger's activity watermark and re-ingests only the sessions that changed
//! while the tracker was not listening. Also reseeds the tracker's session
//! lineage from the full session list so subagent prompts arriving right
//! after a restart are classified correctly.

use crate::backfill::{ingest_session_messages, BackfillStats, WritePolicy};
use crate::db::Database;
use crate::error::Result;
use crate::host::HostClient;
use crate::reconcile::tracker::TrackerState;
use crate::types::{SessionInfo, SessionRecord};

/// Catch the ledger up on sessions that changed while the tracker was down.
///
/// Returns the tracker state seeded with session lineage, plus run counters.
pub fn backfill_sessions<H: HostClient>(
    db: &Database,
    host: &H,
    state: TrackerState,
) -> Result<(TrackerState, BackfillStats)> {
    let mut stats = BackfillStats::default();

    let watermark = db.max_session_updated_at()?;
    let sessions = host.list_sessions()?;
    stats.sessions.found = sessions.len();

    tracing::info!(
        sessions = sessions.len(),
        watermark = ?watermark,
        "Starting incremental backfill"
    );

    // Lineage is seeded from every session, changed or not
    let mut state = sessions.iter().fold(state, |state, info| {
        state.record_session(&info.id, info.parent_id.as_deref())
    });

    let mut changed: Vec<&SessionInfo> = sessions
        .iter()
        .filter(|info| watermark.map_or(true, |w| info.time.updated > w))
        .collect();

    // Main sessions first: a subagent's turn attribution needs the parent's
    // turns in the store
    changed.sort_by_key(|info| (info.is_subagent(), info.time.created));

    for info in changed {
        match backfill_one(db, host, &mut state, info, &mut stats) {
            Ok(()) => stats.sessions.processed += 1,
            Err(e) => {
                stats.sessions.errors += 1;
                tracing::warn!(session = %info.id, error = %e, "Backfill failed for session");
                db.log_error(
                    "backfill.session",
                    Some(&info.id),
                    &e.to_string(),
                    None,
                );
            }
        }
    }

    stats.sessions.skipped = stats
        .sessions
        .found
        .saturating_sub(stats.sessions.processed + stats.sessions.errors);

    tracing::info!(
        processed = stats.sessions.processed,
        skipped = stats.sessions.skipped,
        errors = stats.sessions.errors,
        "Incremental backfill complete"
    );

    Ok((state, stats))
}

fn backfill_one<H: HostClient>(
    db: &Database,
    host: &H,
    state: &mut TrackerState,
    info: &SessionInfo,
    stats: &mut BackfillStats,
) -> Result<()> {
    db.merge_session(&SessionRecord::from_info(info, None))?;

    // A subagent's activity belongs to the parent turn already running when
    // the subagent session was created
    let inherited_turn = match &info.parent_id {
        Some(parent_id) => {
            let turn = db.latest_turn_at_or_before(parent_id, info.time.created)?;
            if let Some(turn_id) = &turn {
                *state = state.clone().inherit_turn(&info.id, turn_id);
            }
            turn
        }
        None => None,
    };

    let mut messages = host.session_messages(&info.id)?;
    ingest_session_messages(
        db,
        info,
        &mut messages,
        inherited_turn.as_deref(),
        WritePolicy::Merge,
        stats,
    )
}
