//! In-process [`AggregateStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{AggregateStore, RecordKey, RecordPatch, TaskRecord};
use crate::error::{Result, TrackerError};

/// HashMap-backed store.
///
/// Counts `update_one` calls so tests can assert on write-through
/// behaviour.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<RecordKey, TaskRecord>>,
    updates: AtomicUsize,
    fail_updates: Mutex<Option<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update_one` calls that reached the store.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make every subsequent `update_one` fail with `message` (or succeed again with `None`).
    pub fn set_update_failure(&self, message: Option<&str>) {
        *self
            .fail_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = message.map(str::to_string);
    }

    /// Synchronous read for assertions.
    pub fn get(&self, key: &RecordKey) -> Option<TaskRecord> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RecordKey, TaskRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.lock().insert(record.key, record);
        Ok(())
    }

    async fn update_one(&self, key: &RecordKey, patch: RecordPatch) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self
            .fail_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(TrackerError::persistence(message));
        }

        let mut records = self.lock();
        let record = records.get_mut(key).ok_or_else(|| TrackerError::RecordNotFound {
            key: key.to_string(),
        })?;
        patch.check_owner(key, record.query_id.as_deref())?;
        record.apply(patch);
        Ok(())
    }

    async fn find_one(&self, key: &RecordKey) -> Result<Option<TaskRecord>> {
        Ok(self.get(key))
    }

    async fn find_by_query_id(&self, query_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .lock()
            .values()
            .find(|r| r.query_id.as_deref() == Some(query_id))
            .cloned())
    }

    async fn find_all(&self) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self.lock().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
