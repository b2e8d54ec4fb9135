//! SQLite token store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_protocols::OwnerRef;
use rusqlite::{Row, params};
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::ContinuationError;
use crate::schema::init_schema;
use crate::store::TokenStore;
use crate::token::ContinuationToken;

const SELECT_COLUMNS: &str = "SELECT id, run_id, phase_id, task_id, activity_id, activity_type, \
                              chunk_index, total_chunks, state, processed_items, remaining_items, \
                              progress, created_at, expires_at, metadata FROM continuation_tokens";

/// SQLite-backed token store.
pub struct SqliteTokenStore {
    conn: Connection,
}

impl SqliteTokenStore {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ContinuationError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path).await?;
        conn.call(|conn| init_schema(conn)).await?;
        Ok(Self { conn })
    }

    /// Create an in-memory database.
    pub async fn in_memory() -> Result<Self, ContinuationError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| init_schema(conn)).await?;
        Ok(Self { conn })
    }

    async fn query(
        &self,
        sql: String,
        args: Vec<String>,
    ) -> Result<Vec<ContinuationToken>, ContinuationError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args), TokenRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(TokenRow::into_token).collect()
    }
}

struct TokenRow {
    id: String,
    run_id: Option<String>,
    phase_id: Option<String>,
    task_id: Option<String>,
    activity_id: String,
    activity_type: String,
    chunk_index: i64,
    total_chunks: i64,
    state: String,
    processed_items: String,
    remaining_items: String,
    progress: f64,
    created_at: i64,
    expires_at: i64,
    metadata: String,
}

impl TokenRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_id: row.get(2)?,
            task_id: row.get(3)?,
            activity_id: row.get(4)?,
            activity_type: row.get(5)?,
            chunk_index: row.get(6)?,
            total_chunks: row.get(7)?,
            state: row.get(8)?,
            processed_items: row.get(9)?,
            remaining_items: row.get(10)?,
            progress: row.get(11)?,
            created_at: row.get(12)?,
            expires_at: row.get(13)?,
            metadata: row.get(14)?,
        })
    }

    fn into_token(self) -> Result<ContinuationToken, ContinuationError> {
        Ok(ContinuationToken {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| ContinuationError::InvalidData(format!("bad token id: {}", e)))?,
            owner: OwnerRef {
                run_id: self.run_id,
                phase_id: self.phase_id,
                task_id: self.task_id,
            },
            activity_id: self.activity_id,
            activity_type: self.activity_type,
            chunk_index: to_index(self.chunk_index)?,
            total_chunks: to_index(self.total_chunks)?,
            state: serde_json::from_str(&self.state)?,
            processed_items: serde_json::from_str(&self.processed_items)?,
            remaining_items: serde_json::from_str(&self.remaining_items)?,
            progress: self.progress,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn to_index(value: i64) -> Result<usize, ContinuationError> {
    usize::try_from(value)
        .map_err(|_| ContinuationError::InvalidData(format!("negative chunk count: {}", value)))
}

fn to_column(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, ContinuationError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ContinuationError::InvalidData(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn save(&self, token: &ContinuationToken) -> Result<(), ContinuationError> {
        let token = token.clone();
        let state = serde_json::to_string(&token.state)?;
        let processed = serde_json::to_string(&token.processed_items)?;
        let remaining = serde_json::to_string(&token.remaining_items)?;
        let metadata = serde_json::to_string(&token.metadata)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO continuation_tokens (id, run_id, phase_id, task_id,
                     activity_id, activity_type, chunk_index, total_chunks, state,
                     processed_items, remaining_items, progress, created_at, expires_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        token.id.to_string(),
                        token.owner.run_id,
                        token.owner.phase_id,
                        token.owner.task_id,
                        token.activity_id,
                        token.activity_type,
                        to_column(token.chunk_index),
                        to_column(token.total_chunks),
                        state,
                        processed,
                        remaining,
                        token.progress,
                        token.created_at.timestamp_millis(),
                        token.expires_at.timestamp_millis(),
                        metadata,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ContinuationToken>, ContinuationError> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
                match stmt.query_row([&id], TokenRow::from_row) {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        row.map(TokenRow::into_token).transpose()
    }

    async fn latest_for_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<ContinuationToken>, ContinuationError> {
        let sql = format!(
            "{} WHERE activity_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let mut tokens = self.query(sql, vec![activity_id.to_string()]).await?;
        Ok(tokens.pop())
    }

    async fn list(
        &self,
        activity_id: Option<&str>,
    ) -> Result<Vec<ContinuationToken>, ContinuationError> {
        match activity_id {
            Some(id) => {
                let sql = format!(
                    "{} WHERE activity_id = ?1 ORDER BY created_at, rowid",
                    SELECT_COLUMNS
                );
                self.query(sql, vec![id.to_string()]).await
            }
            None => {
                let sql = format!("{} ORDER BY created_at, rowid", SELECT_COLUMNS);
                self.query(sql, Vec::new()).await
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ContinuationError> {
        let cutoff = now.timestamp_millis();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM continuation_tokens WHERE expires_at <= ?1",
                    [cutoff],
                )?;
                Ok(removed)
            })
            .await?;
        debug!("Purged {} expired continuation tokens", removed);
        Ok(removed)
    }
}
