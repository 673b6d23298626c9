use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::model::{QueryResult, TaskInfo};
use crate::resultset::{CodecError, ResultSet};
use crate::storage::schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task has not been set up")]
    NoCurrentTask,
    #[error("task id is required")]
    EmptyTaskId,
    #[error("encode result set: {0}")]
    Encode(#[source] CodecError),
    #[error("decode result set: {0}")]
    Decode(#[source] CodecError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Task-scoped persistence of captured query results on embedded SQLite.
///
/// Clones share one connection; writes from concurrent workers serialize on
/// it. All data operations are scoped to the task installed by
/// [`setup`](Self::setup).
#[derive(Clone)]
pub struct ResultStore {
    conn: Arc<Mutex<Connection>>,
    current: Arc<Mutex<Option<TaskInfo>>>,
}

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(schema::DDL)?;
        Ok(ResultStore {
            conn: Arc::new(Mutex::new(conn)),
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn current_task(&self) -> Option<TaskInfo> {
        self.current.lock().unwrap().clone()
    }

    fn current_task_id(&self) -> Result<String, StoreError> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or(StoreError::NoCurrentTask)
    }

    /// Installs the current task. If a task row with the same id already
    /// exists, the persisted `(name, meta, time)` win over the supplied
    /// ones; otherwise the supplied info is inserted and adopted.
    pub fn setup(&self, mut info: TaskInfo) -> Result<(), StoreError> {
        if info.id.is_empty() {
            return Err(StoreError::EmptyTaskId);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                "SELECT name, meta, time FROM task WHERE id = ?1",
                params![info.id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match existing {
            Some((name, meta, time)) => {
                info.name = name;
                info.meta = meta.into_bytes();
                info.time = unix_to_datetime(time);
            }
            None => {
                let meta = String::from_utf8_lossy(&info.meta).into_owned();
                tx.execute(
                    "INSERT INTO task(id, name, meta, time) VALUES (?1, ?2, ?3, ?4)",
                    params![info.id, info.name, meta, info.time.timestamp()],
                )?;
            }
        }
        tx.commit()?;
        *self.current.lock().unwrap() = Some(info);
        Ok(())
    }

    /// Appends one captured result under the current task. Multiple writes
    /// with the same key are expected; read-back preserves insertion order.
    pub fn write(&self, res: &QueryResult) -> Result<(), StoreError> {
        let task_id = self.current_task_id()?;
        let blob = res.result_set.encode().map_err(StoreError::Encode)?;
        let digest = res.result_set.data_digest();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO result(task_id, key, sql, version, data_digest, result, time, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task_id,
                res.key,
                res.sql,
                res.version,
                digest,
                blob,
                res.time.timestamp(),
                res.duration
            ],
        )?;
        Ok(())
    }

    /// All results for the current task under `key`, in insertion order.
    /// An empty list is not an error.
    pub fn read(&self, key: &str) -> Result<Vec<QueryResult>, StoreError> {
        let task_id = self.current_task_id()?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sql, version, result, time, duration FROM result
             WHERE task_id = ?1 AND key = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id, key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (sql, version, blob, time, duration) = row?;
            out.push(QueryResult {
                time: unix_to_datetime(time),
                duration,
                key: key.to_string(),
                sql,
                version,
                result_set: ResultSet::decode(&blob).map_err(StoreError::Decode)?,
            });
        }
        Ok(out)
    }

    /// Distinct keys with stored results under the current task.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let task_id = self.current_task_id()?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT DISTINCT key FROM result WHERE task_id = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Distinct keys whose recorded state equals `state`.
    pub fn keys_by_state(&self, state: &str) -> Result<Vec<String>, StoreError> {
        let task_id = self.current_task_id()?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT key FROM key_state WHERE task_id = ?1 AND state = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![task_id, state], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Upserts the diff state for `key`. Marking twice with the same state
    /// is equivalent to marking once.
    pub fn mark(&self, key: &str, state: &str) -> Result<(), StoreError> {
        let task_id = self.current_task_id()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO key_state(task_id, key, state) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id, key) DO UPDATE SET state = excluded.state",
            params![task_id, key, state],
        )?;
        Ok(())
    }
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
