//! Database schema for the `timers` table.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the timer schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// Times are unix milliseconds so range scans order correctly.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timers (
    id TEXT PRIMARY KEY,
    run_id TEXT,
    phase_id TEXT,
    task_id TEXT,
    fire_at INTEGER NOT NULL,
    action TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT 'null',
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    fired_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_timers_status_fire_at ON timers(status, fire_at);
CREATE INDEX IF NOT EXISTS idx_timers_run ON timers(run_id, phase_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='timers'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());
    }
}
