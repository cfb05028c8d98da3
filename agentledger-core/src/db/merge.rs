//! Per-field merge policy for upserts
//!
//! The live event stream and the batch backfill paths can both observe the
//! same entity, and either may see it first. Conflict handling is therefore
//! an explicit per-field policy rather than ad-hoc SQL scattered across the
//! repository: each merged column declares how an incoming value combines
//! with an already-stored one.
//!
//! The ground rule is that live data wins. Backfill fills holes (a message
//! whose content was never fetched, a tool call whose turn was unknown) but
//! never clobbers a value the live reconciler already wrote.

/// How an incoming column value combines with the stored one on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Incoming value always replaces the stored one
    Always,
    /// Incoming value applies only when the stored value is NULL
    IfNull,
    /// Incoming value applies only when the stored value is NULL or ''
    IfEmptyText,
}

impl Overwrite {
    /// SQL assignment for this column inside an `ON CONFLICT DO UPDATE SET`.
    fn assignment(self, table: &str, column: &str) -> String {
        match self {
            Overwrite::Always => format!("{col} = excluded.{col}", col = column),
            Overwrite::IfNull => format!(
                "{col} = COALESCE({table}.{col}, excluded.{col})",
                table = table,
                col = column
            ),
            Overwrite::IfEmptyText => format!(
                "{col} = COALESCE(NULLIF({table}.{col}, ''), excluded.{col})",
                table = table,
                col = column
            ),
        }
    }
}

/// Merge policy for one table: the columns touched on conflict and how.
/// Columns not listed keep their stored value.
pub struct MergePolicy {
    pub table: &'static str,
    pub fields: &'static [(&'static str, Overwrite)],
}

impl MergePolicy {
    /// Render the `ON CONFLICT(id) DO UPDATE SET ...` clause.
    pub fn on_conflict_clause(&self) -> String {
        let assignments: Vec<String> = self
            .fields
            .iter()
            .map(|(column, rule)| rule.assignment(self.table, column))
            .collect();

        format!("ON CONFLICT(id) DO UPDATE SET {}", assignments.join(", "))
    }
}

/// Backfill merge for `sessions`: the snapshot's title/lineage/activity are
/// authoritative, lifecycle columns (ended_at) belong to the live reconciler.
pub const SESSION_MERGE: MergePolicy = MergePolicy {
    table: "sessions",
    fields: &[
        ("title", Overwrite::Always),
        ("parent_id", Overwrite::Always),
        ("updated_at", Overwrite::Always),
    ],
};

/// Backfill merge for `turns`: only fill a missing prompt text.
pub const TURN_MERGE: MergePolicy = MergePolicy {
    table: "turns",
    fields: &[("user_message", Overwrite::IfNull)],
};

/// Backfill merge for `messages`: fill empty content and missing turn
/// attribution, leave everything the live reconciler wrote untouched.
pub const MESSAGE_MERGE: MergePolicy = MergePolicy {
    table: "messages",
    fields: &[
        ("content", Overwrite::IfEmptyText),
        ("turn_id", Overwrite::IfNull),
    ],
};

/// Backfill merge for `tool_calls`: only fill missing turn attribution.
pub const TOOL_CALL_MERGE: MergePolicy = MergePolicy {
    table: "tool_calls",
    fields: &[("turn_id", Overwrite::IfNull)],
};
