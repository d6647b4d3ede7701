use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    entity_id BLOB PRIMARY KEY CHECK (length(entity_id) = 16),
    revision INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);

CREATE TABLE IF NOT EXISTS fields (
    entity_id BLOB NOT NULL REFERENCES entities (entity_id),
    field_key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (entity_id, field_key)
);

CREATE TABLE IF NOT EXISTS sub_entities (
    entity_id BLOB NOT NULL REFERENCES entities (entity_id),
    sub_id BLOB NOT NULL CHECK (length(sub_id) = 16),
    collection TEXT NOT NULL,
    body BLOB NOT NULL,
    PRIMARY KEY (entity_id, sub_id)
);
CREATE INDEX IF NOT EXISTS idx_sub_entities_collection ON sub_entities (entity_id, collection);

CREATE TABLE IF NOT EXISTS ledger (
    entity_id BLOB NOT NULL REFERENCES entities (entity_id),
    provenance BLOB NOT NULL CHECK (length(provenance) = 16),
    contribution BLOB NOT NULL,
    PRIMARY KEY (entity_id, provenance)
);

CREATE TABLE IF NOT EXISTS derived (
    entity_id BLOB PRIMARY KEY REFERENCES entities (entity_id),
    body BLOB NOT NULL
);
";
