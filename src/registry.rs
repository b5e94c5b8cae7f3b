//! Concurrency-safe in-memory registry of tracked tasks.
//!
//! The registry is owned by one tracker instance and shared between request
//! handlers (which register tasks) and the tracker's tick loop (which polls,
//! updates and retires them).
//!
//! # Layout
//!
//! ```text
//! TaskRegistry
//!   ├── active:      DashMap<id, Arc<Entry>>   polled every tick
//!   │                  Entry { task: Mutex<TrackedTask>, in_flight: AtomicBool }
//!   ├── retained:    DashMap<id, TrackedTask>  finalized, read-only, time-bounded
//!   ├── by_query_id: DashMap<query_id, id>
//!   └── by_parent:   DashMap<AggregateKey, id>
//! ```
//!
//! The `in_flight` flag is the only thing preventing two polls of the same
//! id from overlapping. It is taken with an atomic test-and-set through
//! [`TaskRegistry::try_begin_poll`] and released when the returned
//! [`PollGuard`] is dropped.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::status::JobStatus;
use crate::task::{AggregateKey, TrackedTask};

struct Entry<St: JobStatus> {
    task: Mutex<TrackedTask<St>>,
    in_flight: AtomicBool,
}

impl<St: JobStatus> Entry<St> {
    fn lock(&self) -> MutexGuard<'_, TrackedTask<St>> {
        // A panic while holding the lock cannot leave a half-written task:
        // every mutation is a plain field assignment.
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn view(&self) -> TrackedTask<St> {
        let mut task = self.lock().clone();
        task.in_flight = self.in_flight.load(Ordering::SeqCst);
        task
    }
}

/// Registry of tasks for one tracker.
pub struct TaskRegistry<St: JobStatus> {
    active: DashMap<String, Arc<Entry<St>>>,
    retained: DashMap<String, TrackedTask<St>>,
    by_query_id: DashMap<String, String>,
    by_parent: DashMap<AggregateKey, String>,
}

impl<St: JobStatus> Default for TaskRegistry<St> {
    fn default() -> Self {
        Self::new()
    }
}

impl<St: JobStatus> TaskRegistry<St> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            retained: DashMap::new(),
            by_query_id: DashMap::new(),
            by_parent: DashMap::new(),
        }
    }

    /// Register a task for polling.
    ///
    /// Returns the previously active task with the same id, if any. A
    /// retained (finalized) task with the same id is dropped. Index entries
    /// of a replaced task stop resolving.
    pub fn register(&self, mut task: TrackedTask<St>) -> Option<TrackedTask<St>> {
        task.in_flight = false;
        let id = task.id.clone();
        let query_id = task.query_id.clone();
        let parent = task.parent;
        let dropped = self.retained.remove(&id).map(|(_, old)| old);

        let entry = Arc::new(Entry {
            task: Mutex::new(task),
            in_flight: AtomicBool::new(false),
        });
        let previous = self
            .active
            .insert(id.clone(), entry)
            .map(|previous| previous.view());

        for old in previous.iter().chain(dropped.iter()) {
            if old.query_id != query_id {
                self.by_query_id.remove_if(&old.query_id, |_, v| *v == old.id);
            }
            if old.parent != parent {
                self.by_parent.remove_if(&old.parent, |_, v| *v == old.id);
            }
        }
        self.by_query_id.insert(query_id, id.clone());
        self.by_parent.insert(parent, id);
        previous
    }

    /// Look up a task by registry id, active or retained.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TrackedTask<St>> {
        // Retirement inserts into `retained` before leaving `active`, so
        // checking in this order never misses a task that is mid-retirement.
        if let Some(entry) = self.active.get(id).map(|e| Arc::clone(e.value())) {
            return Some(entry.view());
        }
        self.retained.get(id).map(|t| t.value().clone())
    }

    /// Look up a task by the AI service's query id.
    #[must_use]
    pub fn get_by_query_id(&self, query_id: &str) -> Option<TrackedTask<St>> {
        let id = self.by_query_id.get(query_id).map(|id| id.value().clone())?;
        self.get(&id)
    }

    /// Look up the most recently registered task for an aggregate.
    #[must_use]
    pub fn get_by_parent(&self, parent: &AggregateKey) -> Option<TrackedTask<St>> {
        let id = self.by_parent.get(parent).map(|id| id.value().clone())?;
        self.get(&id)
    }

    /// Remove a task completely, active or retained.
    pub fn remove(&self, id: &str) -> Option<TrackedTask<St>> {
        let removed = self
            .active
            .remove(id)
            .map(|(_, entry)| entry.view())
            .or_else(|| self.retained.remove(id).map(|(_, task)| task))?;
        self.unindex(&removed);
        Some(removed)
    }

    /// Point-in-time copy of every active task.
    ///
    /// Each task is copied under its own lock, so a snapshot never contains
    /// a half-applied poll result.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackedTask<St>> {
        let entries: Vec<Arc<Entry<St>>> = self
            .active
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        entries.iter().map(|e| e.view()).collect()
    }

    /// Point-in-time copy of every retained (finalized) task.
    #[must_use]
    pub fn retained_snapshot(&self) -> Vec<TrackedTask<St>> {
        self.retained.iter().map(|t| t.value().clone()).collect()
    }

    /// Try to mark a task as being polled.
    ///
    /// Returns `None` if the task is unknown or a poll is already in flight.
    #[must_use]
    pub fn try_begin_poll(&self, id: &str) -> Option<PollGuard<St>> {
        let entry = self.active.get(id).map(|e| Arc::clone(e.value()))?;
        entry
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(PollGuard { entry })
    }

    /// True while the task `guard` was taken on is still the active task
    /// for its id, i.e. it has been neither removed nor replaced.
    #[must_use]
    pub fn is_current(&self, guard: &PollGuard<St>) -> bool {
        let id = guard.entry.lock().id.clone();
        self.active
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &guard.entry))
    }

    /// Take a finalized task out of active polling.
    ///
    /// With `retain` the task stays readable (by id, query id and parent)
    /// until [`evict_expired`](Self::evict_expired) purges it; otherwise it
    /// is forgotten immediately.
    pub fn retire(&self, id: &str, finalized_at: DateTime<Utc>, retain: bool) -> Option<TrackedTask<St>> {
        let entry = self.active.get(id).map(|e| Arc::clone(e.value()))?;
        self.retire_entry(id, &entry, finalized_at, retain)
    }

    /// Retire the task a poll was started on.
    ///
    /// Does nothing if the id has been re-registered since `guard` was
    /// taken: the newer task is left alone.
    pub fn retire_polled(
        &self,
        guard: &PollGuard<St>,
        finalized_at: DateTime<Utc>,
        retain: bool,
    ) -> Option<TrackedTask<St>> {
        let id = guard.entry.lock().id.clone();
        let current = self.active.get(&id).map(|e| Arc::clone(e.value()))?;
        if !Arc::ptr_eq(&current, &guard.entry) {
            return None;
        }
        self.retire_entry(&id, &current, finalized_at, retain)
    }

    fn retire_entry(
        &self,
        id: &str,
        entry: &Arc<Entry<St>>,
        finalized_at: DateTime<Utc>,
        retain: bool,
    ) -> Option<TrackedTask<St>> {
        let mut task = {
            let mut guard = entry.lock();
            if guard.finalized_at.is_none() {
                guard.finalized_at = Some(finalized_at);
            }
            guard.clone()
        };
        task.in_flight = false;

        if retain {
            self.retained.insert(id.to_string(), task.clone());
        }
        if self.active.remove_if(id, |_, current| Arc::ptr_eq(current, entry)).is_none() {
            if retain {
                self.retained.remove(id);
            }
            return None;
        }
        if !retain {
            self.unindex(&task);
        }
        Some(task)
    }

    /// Purge retained tasks whose retention window has elapsed.
    ///
    /// Returns the purged ids.
    pub fn evict_expired(&self, now: DateTime<Utc>, window: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .retained
            .iter()
            .filter(|t| t.finalized_at.is_some_and(|at| now - at >= window))
            .map(|t| t.key().clone())
            .collect();

        for id in &expired {
            if let Some((_, task)) = self.retained.remove(id) {
                self.unindex(&task);
            }
        }
        expired
    }

    /// Number of actively polled tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of retained tasks.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    fn unindex(&self, task: &TrackedTask<St>) {
        self.by_query_id.remove_if(&task.query_id, |_, id| *id == task.id);
        self.by_parent.remove_if(&task.parent, |_, id| *id == task.id);
    }
}

// ============================================================================
// Poll Guard
// ============================================================================

/// Exclusive right to poll one task.
///
/// Releases the task's in-flight flag on drop.
pub struct PollGuard<St: JobStatus> {
    entry: Arc<Entry<St>>,
}

impl<St: JobStatus> PollGuard<St> {
    /// Copy of the task as it is right now.
    #[must_use]
    pub fn task(&self) -> TrackedTask<St> {
        self.entry.view()
    }

    /// Apply a mutation to the task under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut TrackedTask<St>) -> R) -> R {
        let mut task = self.entry.lock();
        f(&mut task)
    }
}

impl<St: JobStatus> Drop for PollGuard<St> {
    fn drop(&mut self) {
        self.entry.in_flight.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
