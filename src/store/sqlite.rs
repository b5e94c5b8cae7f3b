//! SQLite-backed [`AggregateStore`].
//!
//! JSON-valued columns (`detail`, `error`, `merge_error`, `payload`) are
//! stored as TEXT. Every call runs on tokio's blocking pool so a slow disk
//! never stalls the runtime threads that drive polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{AggregateStore, RecordKey, RecordPatch, TaskRecord};
use crate::error::{IntoTrackerError, Result, TrackerError};
use crate::task::{AggregateKey, TaskInput};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_records (
    aggregate_kind TEXT NOT NULL,
    aggregate_id   INTEGER NOT NULL,
    task_kind      TEXT NOT NULL,
    query_id       TEXT,
    status         TEXT,
    detail         TEXT,
    error          TEXT,
    merge_error    TEXT,
    question       TEXT,
    payload        TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (aggregate_kind, aggregate_id, task_kind)
);
CREATE INDEX IF NOT EXISTS idx_task_records_query_id ON task_records(query_id);
";

const SELECT_COLUMNS: &str = "aggregate_kind, aggregate_id, task_kind, query_id, status, \
     detail, error, merge_error, question, payload, created_at, updated_at";

/// Durable store over a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// A private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| TrackerError::persistence("sqlite connection mutex poisoned"))?;
            f(&guard)
        })
        .await
        .into_persistence()?
    }
}

fn json_text(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(TrackerError::from)
}

fn parse_json(text: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn parse_time(text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(text: String) -> rusqlite::Result<T> {
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let parent = AggregateKey::new(parse_enum(row.get(0)?)?, row.get(1)?);
    let kind = parse_enum(row.get(2)?)?;
    Ok(TaskRecord {
        key: RecordKey::new(parent, kind),
        query_id: row.get(3)?,
        status: row.get(4)?,
        detail: parse_json(row.get(5)?)?,
        error: parse_json(row.get(6)?)?,
        merge_error: parse_json(row.get(7)?)?,
        input: TaskInput {
            question: row.get(8)?,
            payload: parse_json(row.get(9)?)?.unwrap_or_default(),
        },
        created_at: parse_time(row.get(10)?)?,
        updated_at: parse_time(row.get(11)?)?,
    })
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO task_records (
                    aggregate_kind, aggregate_id, task_kind, query_id, status,
                    detail, error, merge_error, question, payload, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.key.parent.kind.as_str(),
                    record.key.parent.id,
                    record.key.kind.as_str(),
                    record.query_id,
                    record.status,
                    json_text(&record.detail)?,
                    json_text(&record.error)?,
                    json_text(&record.merge_error)?,
                    record.input.question,
                    serde_json::to_string(&record.input.payload)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_one(&self, key: &RecordKey, patch: RecordPatch) -> Result<()> {
        let key = *key;
        self.with_conn(move |conn| {
            if patch.owner.is_some() {
                let current: Option<Option<String>> = conn
                    .query_row(
                        "SELECT query_id FROM task_records \
                         WHERE aggregate_kind = ?1 AND aggregate_id = ?2 AND task_kind = ?3",
                        params![key.parent.kind.as_str(), key.parent.id, key.kind.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Err(TrackerError::RecordNotFound {
                        key: key.to_string(),
                    });
                };
                patch.check_owner(&key, current.as_deref())?;
            }

            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();

            if let Some(query_id) = patch.query_id {
                sets.push("query_id = ?");
                values.push(SqlValue::Text(query_id));
            }
            if let Some(status) = patch.status {
                sets.push("status = ?");
                values.push(SqlValue::Text(status));
            }
            if let Some(detail) = patch.detail {
                sets.push("detail = ?");
                values.push(SqlValue::Text(serde_json::to_string(&detail)?));
            }
            if patch.clear_errors {
                sets.push("error = NULL");
                sets.push("merge_error = NULL");
            } else {
                if let Some(error) = patch.error {
                    sets.push("error = ?");
                    values.push(SqlValue::Text(serde_json::to_string(&error)?));
                }
                if let Some(merge_error) = patch.merge_error {
                    sets.push("merge_error = ?");
                    values.push(SqlValue::Text(serde_json::to_string(&merge_error)?));
                }
            }
            sets.push("updated_at = ?");
            values.push(SqlValue::Text(Utc::now().to_rfc3339()));

            values.push(SqlValue::Text(key.parent.kind.as_str().to_string()));
            values.push(SqlValue::Integer(key.parent.id));
            values.push(SqlValue::Text(key.kind.as_str().to_string()));

            let sql = format!(
                "UPDATE task_records SET {} \
                 WHERE aggregate_kind = ? AND aggregate_id = ? AND task_kind = ?",
                sets.join(", ")
            );
            let changed = conn.execute(&sql, params_from_iter(values))?;
            if changed == 0 {
                return Err(TrackerError::RecordNotFound {
                    key: key.to_string(),
                });
            }
            debug!(key = %key, "Updated task record");
            Ok(())
        })
        .await
    }

    async fn find_one(&self, key: &RecordKey) -> Result<Option<TaskRecord>> {
        let key = *key;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM task_records \
                 WHERE aggregate_kind = ?1 AND aggregate_id = ?2 AND task_kind = ?3",
                SELECT_COLUMNS
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![key.parent.kind.as_str(), key.parent.id, key.kind.as_str()],
                    row_to_record,
                )
                .optional()?)
        })
        .await
    }

    async fn find_by_query_id(&self, query_id: &str) -> Result<Option<TaskRecord>> {
        let query_id = query_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM task_records WHERE query_id = ?1 LIMIT 1",
                SELECT_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![query_id], row_to_record)
                .optional()?)
        })
        .await
    }

    async fn find_all(&self) -> Result<Vec<TaskRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM task_records ORDER BY created_at",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use serde_json::json;

    fn key() -> RecordKey {
        RecordKey::new(AggregateKey::thread_response(9), TaskKind::AskDetail)
    }

    #[tokio::test]
    async fn test_insert_and_find_one() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(TaskRecord::new(
                key(),
                "q1",
                "UNDERSTANDING",
                TaskInput::question("orders per day"),
            ))
            .await
            .unwrap();

        let record = store.find_one(&key()).await.unwrap().unwrap();
        assert_eq!(record.query_id.as_deref(), Some("q1"));
        assert_eq!(record.status.as_deref(), Some("UNDERSTANDING"));
        assert_eq!(record.input.question.as_deref(), Some("orders per day"));
        assert_eq!(record.input.payload["query"], "orders per day");
        assert!(record.detail.is_none());
    }

    #[tokio::test]
    async fn test_update_one_writes_json_columns() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(TaskRecord::new(key(), "q1", "UNDERSTANDING", TaskInput::default()))
            .await
            .unwrap();

        store
            .update_one(
                &key(),
                RecordPatch::status("FINISHED")
                    .with_detail(Some(json!({"steps": [{"sql": "SELECT 1"}]}))),
            )
            .await
            .unwrap();

        let record = store.find_by_query_id("q1").await.unwrap().unwrap();
        assert_eq!(record.status.as_deref(), Some("FINISHED"));
        assert_eq!(record.detail.unwrap()["steps"][0]["sql"], "SELECT 1");
    }

    #[tokio::test]
    async fn test_update_one_missing_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update_one(&key(), RecordPatch::status("FINISHED"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_owned_patch_refused_after_handover() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(TaskRecord::new(key(), "q1", "UNDERSTANDING", TaskInput::default()))
            .await
            .unwrap();
        store
            .update_one(
                &key(),
                RecordPatch::status("UNDERSTANDING").with_query_id("q2"),
            )
            .await
            .unwrap();

        let err = store
            .update_one(
                &key(),
                RecordPatch::status("FINISHED")
                    .with_detail(Some(json!({"sql": "SELECT 1"})))
                    .owned_by("q1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::RecordSuperseded { .. }));

        let record = store.find_one(&key()).await.unwrap().unwrap();
        assert_eq!(record.status.as_deref(), Some("UNDERSTANDING"));
        assert!(record.detail.is_none());

        store
            .update_one(&key(), RecordPatch::status("GENERATING").owned_by("q2"))
            .await
            .unwrap();
        let record = store.find_one(&key()).await.unwrap().unwrap();
        assert_eq!(record.status.as_deref(), Some("GENERATING"));
    }

    #[tokio::test]
    async fn test_clear_errors() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(TaskRecord::new(key(), "q1", "UNDERSTANDING", TaskInput::default()))
            .await
            .unwrap();
        store
            .update_one(
                &key(),
                RecordPatch::status("FAILED").with_error(Some(json!({"code": "NO_RELEVANT_SQL"}))),
            )
            .await
            .unwrap();
        store
            .update_one(
                &key(),
                RecordPatch::status("UNDERSTANDING")
                    .with_query_id("q2")
                    .clearing_errors(),
            )
            .await
            .unwrap();

        let record = store.find_one(&key()).await.unwrap().unwrap();
        assert!(record.error.is_none());
        assert_eq!(record.query_id.as_deref(), Some("q2"));
    }

    #[tokio::test]
    async fn test_find_all_returns_every_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in 1..=3 {
            store
                .insert(TaskRecord::new(
                    RecordKey::new(AggregateKey::thread_response(id), TaskKind::Chart),
                    format!("c{}", id),
                    "FETCHING",
                    TaskInput::default(),
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.find_all().await.unwrap().len(), 3);
    }
}
