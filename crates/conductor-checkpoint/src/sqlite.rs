//! SQLite-backed checkpoint store.
//!
//! Uses rusqlite with WAL mode. Every call runs on
//! `tokio::task::spawn_blocking` so the async runtime is never blocked on disk.

use crate::checkpoint::{Checkpoint, CheckpointMetadata, PendingWrite};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id       TEXT NOT NULL,
    checkpoint_id   TEXT NOT NULL,
    parent_id       TEXT,
    checkpoint_data TEXT NOT NULL,
    metadata        TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    seq             INTEGER NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_id)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_order ON checkpoints(thread_id, created_at, seq);

CREATE TABLE IF NOT EXISTS writes (
    thread_id       TEXT NOT NULL,
    checkpoint_id   TEXT NOT NULL,
    step_id         TEXT NOT NULL,
    channel         TEXT NOT NULL,
    write_data      TEXT NOT NULL,
    idx             INTEGER NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_id, step_id, idx)
);
";

const SELECT_COLUMNS: &str =
    "checkpoint_id, thread_id, parent_id, checkpoint_data, metadata, created_at";

/// A checkpoint row before its JSON columns are decoded.
struct RawCheckpoint {
    id: String,
    thread_id: String,
    parent_id: Option<String>,
    data: String,
    metadata: String,
    created_at: i64,
}

impl RawCheckpoint {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            parent_id: row.get(2)?,
            data: row.get(3)?,
            metadata: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> ConductorResult<Checkpoint> {
        let metadata: CheckpointMetadata = serde_json::from_str(&self.metadata)
            .map_err(|e| ConductorError::Storage(format!("corrupt checkpoint metadata: {e}")))?;
        let state = serde_json::from_str(&self.data)
            .map_err(|e| ConductorError::Storage(format!("corrupt checkpoint data: {e}")))?;
        let created_at = DateTime::<Utc>::from_timestamp_micros(self.created_at).ok_or_else(|| {
            ConductorError::Storage(format!("invalid checkpoint timestamp {}", self.created_at))
        })?;
        Ok(Checkpoint {
            id: self.id,
            thread_id: self.thread_id,
            parent_id: self.parent_id,
            state,
            metadata,
            created_at,
        })
    }
}

/// Checkpoint store persisted in a single SQLite database file.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Opens (or creates) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| ConductorError::Storage(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| ConductorError::Storage(format!("failed to set pragmas: {e}")))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Checkpoint database opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> ConductorResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ConductorError::Storage(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> ConductorResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| ConductorError::Storage(format!("failed to create tables: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> ConductorResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard).map_err(|e| ConductorError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| ConductorError::Storage(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> ConductorResult<String> {
        let data = serde_json::to_string(&checkpoint.state)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;
        let id = checkpoint.id.clone();
        let thread_id = checkpoint.thread_id.clone();
        let parent_id = checkpoint.parent_id.clone();
        let created_at = checkpoint.created_at.timestamp_micros();
        let returned = id.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints
                    (thread_id, checkpoint_id, parent_id, checkpoint_data, metadata, created_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, (SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints))
                 ON CONFLICT(thread_id, checkpoint_id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    checkpoint_data = excluded.checkpoint_data,
                    metadata = excluded.metadata,
                    created_at = excluded.created_at",
                params![thread_id, id, parent_id, data, metadata, created_at],
            )
        })
        .await?;
        Ok(returned)
    }

    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> ConductorResult<Option<Checkpoint>> {
        let thread_id = thread_id.to_string();
        let checkpoint_id = checkpoint_id.map(str::to_string);
        let raw = self
            .with_conn(move |conn| match checkpoint_id {
                Some(id) => conn
                    .query_row(
                        &format!(
                            "SELECT {SELECT_COLUMNS} FROM checkpoints
                             WHERE thread_id = ?1 AND checkpoint_id = ?2"
                        ),
                        params![thread_id, id],
                        RawCheckpoint::from_row,
                    )
                    .optional(),
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {SELECT_COLUMNS} FROM checkpoints
                             WHERE thread_id = ?1
                             ORDER BY created_at DESC, seq DESC LIMIT 1"
                        ),
                        params![thread_id],
                        RawCheckpoint::from_row,
                    )
                    .optional(),
            })
            .await?;
        raw.map(RawCheckpoint::decode).transpose()
    }

    async fn list(
        &self,
        thread_id: &str,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> ConductorResult<Vec<Checkpoint>> {
        let thread = thread_id.to_string();
        let before_id = before.map(str::to_string);
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = self
            .with_conn(move |conn| {
                let cursor = match &before_id {
                    Some(id) => {
                        let position: Option<(i64, i64)> = conn
                            .query_row(
                                "SELECT created_at, seq FROM checkpoints
                                 WHERE thread_id = ?1 AND checkpoint_id = ?2",
                                params![thread, id],
                                |row| Ok((row.get(0)?, row.get(1)?)),
                            )
                            .optional()?;
                        match position {
                            Some(p) => Some(p),
                            None => return Ok(None),
                        }
                    }
                    None => None,
                };
                let (created_at, seq) = cursor.unwrap_or((i64::MAX, i64::MAX));
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM checkpoints
                     WHERE thread_id = ?1
                       AND (created_at < ?2 OR (created_at = ?2 AND seq < ?3))
                     ORDER BY created_at DESC, seq DESC
                     LIMIT ?4"
                ))?;
                let rows = stmt
                    .query_map(params![thread, created_at, seq, limit], RawCheckpoint::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some(rows))
            })
            .await?;

        let Some(rows) = rows else {
            return Err(ConductorError::NotFound(format!(
                "checkpoint {} in thread {thread_id}",
                before.unwrap_or_default()
            )));
        };
        rows.into_iter().map(RawCheckpoint::decode).collect()
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        writes: &[PendingWrite],
    ) -> ConductorResult<()> {
        let encoded = writes
            .iter()
            .map(|w| -> ConductorResult<_> {
                let data = serde_json::to_string(&w.value)?;
                Ok((w.step.clone(), w.channel.clone(), data, w.index as i64))
            })
            .collect::<ConductorResult<Vec<_>>>()?;
        let thread_id = thread_id.to_string();
        let checkpoint_id = checkpoint_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO writes (thread_id, checkpoint_id, step_id, channel, write_data, idx)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(thread_id, checkpoint_id, step_id, idx) DO UPDATE SET
                        channel = excluded.channel,
                        write_data = excluded.write_data",
                )?;
                for (step, channel, data, idx) in &encoded {
                    stmt.execute(params![thread_id, checkpoint_id, step, channel, data, idx])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> ConductorResult<Vec<PendingWrite>> {
        let thread_id = thread_id.to_string();
        let checkpoint_id = checkpoint_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT step_id, channel, write_data, idx FROM writes
                     WHERE thread_id = ?1 AND checkpoint_id = ?2
                     ORDER BY step_id, idx",
                )?;
                let rows = stmt
                    .query_map(params![thread_id, checkpoint_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(step, channel, data, idx)| -> ConductorResult<PendingWrite> {
                Ok(PendingWrite {
                    step,
                    channel,
                    value: serde_json::from_str(&data)
                        .map_err(|e| ConductorError::Storage(format!("corrupt pending write: {e}")))?,
                    index: usize::try_from(idx)
                        .map_err(|e| ConductorError::Storage(format!("invalid write index: {e}")))?,
                })
            })
            .collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> ConductorResult<()> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM writes WHERE thread_id = ?1", params![thread_id])?;
            tx.execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![thread_id])?;
            tx.commit()
        })
        .await
    }

    async fn threads(&self) -> ConductorResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }
}
