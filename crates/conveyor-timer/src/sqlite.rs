//! SQLite timer store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_protocols::OwnerRef;
use rusqlite::{Row, params};
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::TimerError;
use crate::schema::init_schema;
use crate::store::TimerStore;
use crate::timer::{Timer, TimerStatus};

const SELECT_COLUMNS: &str = "SELECT id, run_id, phase_id, task_id, fire_at, action, payload, \
                              status, created_at, fired_at FROM timers";

/// SQLite-backed timer store.
pub struct SqliteTimerStore {
    conn: Connection,
}

impl SqliteTimerStore {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TimerError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path).await?;
        conn.call(|conn| init_schema(conn)).await?;
        Ok(Self { conn })
    }

    /// Create an in-memory database.
    pub async fn in_memory() -> Result<Self, TimerError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| init_schema(conn)).await?;
        Ok(Self { conn })
    }

    async fn query(&self, sql: String, args: Vec<i64>) -> Result<Vec<Timer>, TimerError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args), TimerRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(TimerRow::into_timer).collect()
    }
}

/// Raw column values, converted outside the connection thread.
struct TimerRow {
    id: String,
    run_id: Option<String>,
    phase_id: Option<String>,
    task_id: Option<String>,
    fire_at: i64,
    action: String,
    payload: String,
    status: String,
    created_at: i64,
    fired_at: Option<i64>,
}

impl TimerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_id: row.get(2)?,
            task_id: row.get(3)?,
            fire_at: row.get(4)?,
            action: row.get(5)?,
            payload: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
            fired_at: row.get(9)?,
        })
    }

    fn into_timer(self) -> Result<Timer, TimerError> {
        Ok(Timer {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| TimerError::InvalidData(format!("bad timer id: {}", e)))?,
            owner: OwnerRef {
                run_id: self.run_id,
                phase_id: self.phase_id,
                task_id: self.task_id,
            },
            fire_at: from_millis(self.fire_at)?,
            action: self.action.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            status: self.status.parse()?,
            created_at: from_millis(self.created_at)?,
            fired_at: self.fired_at.map(from_millis).transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, TimerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TimerError::InvalidData(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl TimerStore for SqliteTimerStore {
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError> {
        let timer = timer.clone();
        let payload = serde_json::to_string(&timer.payload)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO timers (id, run_id, phase_id, task_id, fire_at, action, payload,
                     status, created_at, fired_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        timer.id.to_string(),
                        timer.owner.run_id,
                        timer.owner.phase_id,
                        timer.owner.task_id,
                        timer.fire_at.timestamp_millis(),
                        timer.action.as_str(),
                        payload,
                        timer.status.as_str(),
                        timer.created_at.timestamp_millis(),
                        timer.fired_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Timer>, TimerError> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
                match stmt.query_row([&id], TimerRow::from_row) {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        row.map(TimerRow::into_timer).transpose()
    }

    async fn pending(&self) -> Result<Vec<Timer>, TimerError> {
        self.list(Some(TimerStatus::Pending)).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError> {
        let sql = format!(
            "{} WHERE status = 'pending' AND fire_at <= ?1 ORDER BY fire_at, created_at LIMIT ?2",
            SELECT_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(sql, vec![now.timestamp_millis(), limit]).await
    }

    async fn mark_fired(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, TimerError> {
        let id = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE timers SET status = 'fired', fired_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![at.timestamp_millis(), id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed == 1)
    }

    async fn cancel(&self, id: &Uuid) -> Result<bool, TimerError> {
        let id = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE timers SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
                    [&id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed == 1)
    }

    async fn list(&self, status: Option<TimerStatus>) -> Result<Vec<Timer>, TimerError> {
        let sql = match status {
            Some(status) => format!(
                "{} WHERE status = '{}' ORDER BY fire_at, created_at",
                SELECT_COLUMNS,
                status.as_str()
            ),
            None => format!("{} ORDER BY fire_at, created_at", SELECT_COLUMNS),
        };
        self.query(sql, Vec::new()).await
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, TimerError> {
        let cutoff = older_than.timestamp_millis();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM timers WHERE status != 'pending'
                     AND COALESCE(fired_at, created_at) < ?1",
                    [cutoff],
                )?;
                Ok(removed)
            })
            .await?;
        debug!("Purged {} terminal timers", removed);
        Ok(removed)
    }
}
