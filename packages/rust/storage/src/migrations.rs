//! SQL migration definitions for the mcpextract database.
//!
//! Migrations are applied in order on database open. Each migration records
//! its version in `schema_migrations`.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: sources, source_warnings, batch_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One record per processed source
CREATE TABLE IF NOT EXISTS sources (
    source_id    TEXT PRIMARY KEY,
    name         TEXT,
    disposition  TEXT NOT NULL CHECK (disposition IN ('approved', 'needs_review', 'rejected')),
    confidence   REAL NOT NULL,
    config_type  TEXT,
    bundle_hash  TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    record_json  TEXT NOT NULL,
    error        TEXT,
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_disposition ON sources(disposition);

-- Validation warnings, written with their record
CREATE TABLE IF NOT EXISTS source_warnings (
    source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
    position  INTEGER NOT NULL,
    message   TEXT NOT NULL,
    PRIMARY KEY (source_id, position)
);

-- Batch run bookkeeping
CREATE TABLE IF NOT EXISTS batch_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
