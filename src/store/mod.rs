//! Persistence contract for the aggregates trackers write into.
//!
//! Each job kind owns one record per aggregate, addressed by a
//! [`RecordKey`] of `(aggregate, kind)`. The record mirrors the last
//! write-through of a tracker: status, the normalized `detail` blob, the
//! remote `error`, and a separate `merge_error` for local post-processing
//! failures.
//!
//! - [`AggregateStore`] - the async contract (`insert`, `update_one`,
//!   `find_one`, `find_by_query_id`, `find_all`)
//! - [`pending`] - records still waiting on the AI service
//! - [`SqliteStore`] - durable implementation over `rusqlite`
//! - [`MemoryStore`] - in-process implementation with write counting

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Result, TrackerError};
use crate::status::is_finalized_raw;
use crate::task::{AggregateKey, TaskInput, TaskKind};

/// Address of one job record on an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub parent: AggregateKey,
    pub kind: TaskKind,
}

impl RecordKey {
    #[must_use]
    pub fn new(parent: AggregateKey, kind: TaskKind) -> Self {
        Self { parent, kind }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.kind)
    }
}

/// Persisted state of one job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub key: RecordKey,
    pub query_id: Option<String>,
    pub status: Option<String>,
    pub detail: Option<Value>,
    pub error: Option<Value>,
    pub merge_error: Option<Value>,
    pub input: TaskInput,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A new record for a just-submitted job.
    #[must_use]
    pub fn new(key: RecordKey, query_id: impl Into<String>, status: &str, input: TaskInput) -> Self {
        let now = Utc::now();
        Self {
            key,
            query_id: Some(query_id.into()),
            status: Some(status.to_string()),
            detail: None,
            error: None,
            merge_error: None,
            input,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(query_id) = patch.query_id {
            self.query_id = Some(query_id);
        }
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(detail) = patch.detail {
            self.detail = Some(detail);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(merge_error) = patch.merge_error {
            self.merge_error = Some(merge_error);
        }
        if patch.clear_errors {
            self.error = None;
            self.merge_error = None;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update: `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub query_id: Option<String>,
    pub status: Option<String>,
    pub detail: Option<Value>,
    pub error: Option<Value>,
    pub merge_error: Option<Value>,
    /// Reset `error` and `merge_error` (applied after the fields above)
    pub clear_errors: bool,
    /// Apply only while the record still belongs to this query id
    pub owner: Option<String>,
}

impl RecordPatch {
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn detail(detail: Value) -> Self {
        Self {
            detail: Some(detail),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn merge_error(error: Value) -> Self {
        Self {
            merge_error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Option<Value>) -> Self {
        self.detail = detail;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<Value>) -> Self {
        self.error = error;
        self
    }

    #[must_use]
    pub fn clearing_errors(mut self) -> Self {
        self.clear_errors = true;
        self
    }

    /// Guard the write: the store refuses it once the record has been
    /// handed to another job.
    #[must_use]
    pub fn owned_by(mut self, query_id: impl Into<String>) -> Self {
        self.owner = Some(query_id.into());
        self
    }

    /// Check the ownership guard against the record's current query id.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RecordSuperseded`] if the patch is guarded
    /// and `current` names a different job.
    pub fn check_owner(&self, key: &RecordKey, current: Option<&str>) -> Result<()> {
        match &self.owner {
            Some(owner) if current != Some(owner.as_str()) => Err(TrackerError::RecordSuperseded {
                key: key.to_string(),
                query_id: owner.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Durable storage the trackers write through to.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Insert a record, replacing any existing one with the same key.
    async fn insert(&self, record: TaskRecord) -> Result<()>;

    /// Apply a partial update to an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::RecordNotFound`](crate::TrackerError::RecordNotFound)
    /// if no record has this key, and
    /// [`TrackerError::RecordSuperseded`](crate::TrackerError::RecordSuperseded)
    /// if the patch is [owned](RecordPatch::owned_by) by a job the record no
    /// longer belongs to. A refused patch changes nothing.
    async fn update_one(&self, key: &RecordKey, patch: RecordPatch) -> Result<()>;

    async fn find_one(&self, key: &RecordKey) -> Result<Option<TaskRecord>>;

    async fn find_by_query_id(&self, query_id: &str) -> Result<Option<TaskRecord>>;

    async fn find_all(&self) -> Result<Vec<TaskRecord>>;
}

/// Records that have not reached a terminal status.
///
/// A record whose status cannot be classified counts as pending.
pub async fn pending(store: &dyn AggregateStore) -> Result<Vec<TaskRecord>> {
    let records = store.find_all().await?;
    Ok(records
        .into_iter()
        .filter(|record| match record.status.as_deref() {
            Some(raw) => !is_finalized_raw(record.key.kind, raw).unwrap_or(false),
            None => true,
        })
        .collect())
}
