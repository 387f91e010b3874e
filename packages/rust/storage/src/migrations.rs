//! SQL migration definitions for the stitcher task database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: bundles, bundle_documents, tasks",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Bundle definitions
CREATE TABLE IF NOT EXISTS bundles (
    id                    TEXT PRIMARY KEY,
    title                 TEXT NOT NULL,
    filename              TEXT,
    layout_json           TEXT NOT NULL,
    stitched_document_uri TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

-- Ordered document references of a bundle
CREATE TABLE IF NOT EXISTS bundle_documents (
    bundle_id    TEXT NOT NULL REFERENCES bundles(id) ON DELETE CASCADE,
    sort_index   INTEGER NOT NULL,
    document_id  TEXT NOT NULL,
    filename     TEXT NOT NULL,
    content_hash TEXT,
    page_start   INTEGER,
    page_end     INTEGER,
    PRIMARY KEY (bundle_id, sort_index)
);

-- Stitching tasks
CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    bundle_id           TEXT NOT NULL REFERENCES bundles(id) ON DELETE CASCADE,
    state               TEXT NOT NULL,
    failure_description TEXT,
    version             INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_bundle_id ON tasks(bundle_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index tasks by state for claim queries",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
