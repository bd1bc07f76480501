//! SQLite schema for the local store
//!
//! Three logical tables carry the sync state (cached entities, mutation
//! log, sync cursors). `staged_entities` holds an in-progress hydration
//! until it is swapped in, and `session` holds the single active session.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Single active session (id is always 1)
        CREATE TABLE IF NOT EXISTS session (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            school_id TEXT NOT NULL,
            authenticated_at INTEGER NOT NULL
        );

        -- Live cache; payload is what reads show
        CREATE TABLE IF NOT EXISTS cached_entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            server_payload TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            owner_user_id TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            sync_error TEXT,
            PRIMARY KEY (entity_type, entity_id)
        );

        -- Hydration staging area, same shape as the server snapshot
        CREATE TABLE IF NOT EXISTS staged_entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            owner_user_id TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        -- Append-only log of local writes awaiting acknowledgement
        CREATE TABLE IF NOT EXISTS mutation_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            mutation_id TEXT UNIQUE NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            owner_user_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER,
            status TEXT NOT NULL
        );

        -- Incremental pull watermarks
        CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_type TEXT PRIMARY KEY,
            last_synced_at INTEGER,
            last_sync_token TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_cached_entities_owner ON cached_entities(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_cached_entities_state ON cached_entities(sync_state);
        CREATE INDEX IF NOT EXISTS idx_mutation_log_entity ON mutation_log(entity_type, entity_id, created_at, seq);
        CREATE INDEX IF NOT EXISTS idx_mutation_log_status ON mutation_log(status);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
