//! Database schema for the `continuation_tokens` table.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the token schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// Item sets and state are JSON text; times are unix milliseconds.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS continuation_tokens (
    id TEXT PRIMARY KEY,
    run_id TEXT,
    phase_id TEXT,
    task_id TEXT,
    activity_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'null',
    processed_items TEXT NOT NULL DEFAULT '[]',
    remaining_items TEXT NOT NULL DEFAULT '[]',
    progress REAL NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT 'null'
);

CREATE INDEX IF NOT EXISTS idx_tokens_activity ON continuation_tokens(activity_id, created_at);
CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON continuation_tokens(expires_at);
"#;
