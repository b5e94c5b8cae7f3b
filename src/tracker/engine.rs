//! The generic polling engine shared by every job kind.
//!
//! # Tick
//!
//! ```text
//! tick()
//!   ├── RetentionEvictor::sweep        (trackers with retention only)
//!   └── for task in registry.snapshot()
//!         ├── try_begin_poll(id)?      skip if a poll is still in flight
//!         └── spawn poll(guard)
//!
//! poll(guard)
//!   fetch ─err─> count failure, stay active
//!     │
//!   parse status ─err─> count failure (UnknownStatus), stay active
//!     │
//!   unchanged? ──> refresh last_polled/result, no write
//!     │
//!   persist ─err─> count failure, in-memory status untouched
//!     │
//!   apply status
//!     │
//!   terminal? ──> merge (on success) ─> telemetry ─> retire
//! ```
//!
//! The loop only enumerates and dispatches; all I/O happens in the spawned
//! polls, so one slow or failing task never holds up its siblings.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retention::RetentionEvictor;
use super::strategy::{Services, TrackerStrategy};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TrackerError};
use crate::registry::{PollGuard, TaskRegistry};
use crate::status::JobStatus;
use crate::store::TaskRecord;
use crate::task::{AggregateKey, TaskInput, TaskKind, TrackedTask};
use crate::telemetry::Telemetry;

/// Service name attached to finalization events.
pub const TELEMETRY_SERVICE: &str = "ai_service";

// ============================================================================
// Options
// ============================================================================

/// Tuning knobs for one tracker.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Time between ticks
    pub poll_interval: Duration,
    /// Keep finalized tasks readable for this long (`None` forgets them at once)
    pub retention: Option<chrono::Duration>,
    /// Consecutive failures before a task is flagged stuck (0 disables)
    pub stuck_after_failures: u32,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            retention: None,
            stuck_after_failures: 60,
        }
    }
}

impl TrackerOptions {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, window: chrono::Duration) -> Self {
        self.retention = Some(window);
        self
    }

    #[must_use]
    pub fn with_stuck_after_failures(mut self, failures: u32) -> Self {
        self.stuck_after_failures = failures;
        self
    }
}

// ============================================================================
// Tick Results
// ============================================================================

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Status unchanged, nothing written
    Unchanged,
    /// Non-terminal status change persisted
    Updated,
    /// Terminal status persisted and the task retired
    Finalized { succeeded: bool },
    /// Fetch, status or persistence failure; the task stays active
    Failed,
    /// The task was removed or replaced while the poll was in flight; its
    /// result was dropped
    Superseded,
}

/// Polls started by one tick.
///
/// Dropping this detaches the polls; they still run to completion.
#[must_use = "dropping a tick detaches its polls; call wait() to observe them"]
#[derive(Debug)]
pub struct DispatchedTick {
    handles: Vec<JoinHandle<PollOutcome>>,
    /// Polls started
    pub dispatched: usize,
    /// Tasks skipped because a previous poll was still in flight
    pub skipped: usize,
    /// Retained tasks purged at the start of the tick
    pub evicted: Vec<String>,
}

impl DispatchedTick {
    /// Wait for every poll of this tick to finish.
    pub async fn wait(self) -> Vec<PollOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "Poll task aborted");
                    outcomes.push(PollOutcome::Failed);
                }
            }
        }
        outcomes
    }
}

// ============================================================================
// Tracker
// ============================================================================

struct Inner<S: TrackerStrategy> {
    strategy: S,
    registry: TaskRegistry<S::Status>,
    telemetry: Arc<dyn Telemetry>,
    clock: Arc<dyn Clock>,
    evictor: Option<RetentionEvictor>,
    options: TrackerOptions,
    shutdown: CancellationToken,
}

/// Polls every registered job of one kind until it finalizes.
///
/// Cheap to clone; clones share the registry and the loop.
///
/// # Example
///
/// ```rust,ignore
/// let tracker = Tracker::new(AskDetailStrategy::new(services), telemetry, TrackerOptions::default());
/// let handle = tracker.start();
///
/// let task = tracker.submit(AggregateKey::thread_response(1), TaskInput::question("top customers")).await?;
/// // ... the loop polls until FINISHED/FAILED/STOPPED
///
/// tracker.stop();
/// handle.await?;
/// ```
pub struct Tracker<S: TrackerStrategy> {
    inner: Arc<Inner<S>>,
}

impl<S: TrackerStrategy> Clone for Tracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TrackerStrategy> Tracker<S> {
    #[must_use]
    pub fn new(strategy: S, telemetry: Arc<dyn Telemetry>, options: TrackerOptions) -> Self {
        Self::with_clock(strategy, telemetry, options, Arc::new(SystemClock))
    }

    /// Create a tracker that reads time from `clock`.
    #[must_use]
    pub fn with_clock(
        strategy: S,
        telemetry: Arc<dyn Telemetry>,
        options: TrackerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let evictor = options.retention.map(RetentionEvictor::new);
        Self {
            inner: Arc::new(Inner {
                strategy,
                registry: TaskRegistry::new(),
                telemetry,
                clock,
                evictor,
                options,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.inner.strategy.kind()
    }

    #[must_use]
    pub fn strategy(&self) -> &S {
        &self.inner.strategy
    }

    #[must_use]
    pub fn services(&self) -> &Services {
        self.inner.strategy.services()
    }

    #[must_use]
    pub fn options(&self) -> &TrackerOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn registry(&self) -> &TaskRegistry<S::Status> {
        &self.inner.registry
    }

    // =========================================================================
    // Registration and introspection
    // =========================================================================

    /// Register a task for polling.
    ///
    /// Call this from the code path that obtained the query id, before
    /// answering the end user.
    pub fn add_task(&self, task: TrackedTask<S::Status>) {
        info!(
            kind = %self.kind(),
            task_id = %task.id,
            query_id = %task.query_id,
            parent = %task.parent,
            "Tracking task"
        );
        if let Some(previous) = self.inner.registry.register(task) {
            warn!(kind = %self.kind(), task_id = %previous.id, query_id = %previous.query_id, "Replaced active task with the same id");
        }
    }

    /// Snapshot of every actively polled task.
    #[must_use]
    pub fn get_tasks(&self) -> Vec<TrackedTask<S::Status>> {
        self.inner.registry.snapshot()
    }

    /// Snapshot of finalized tasks still inside their retention window.
    #[must_use]
    pub fn get_retained_tasks(&self) -> Vec<TrackedTask<S::Status>> {
        self.inner.registry.retained_snapshot()
    }

    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<TrackedTask<S::Status>> {
        self.inner.registry.get(id)
    }

    #[must_use]
    pub fn get_by_query_id(&self, query_id: &str) -> Option<TrackedTask<S::Status>> {
        self.inner.registry.get_by_query_id(query_id)
    }

    #[must_use]
    pub fn get_by_parent(&self, parent: &AggregateKey) -> Option<TrackedTask<S::Status>> {
        self.inner.registry.get_by_parent(parent)
    }

    /// Stop tracking a task without finalizing it.
    pub fn remove_task(&self, id: &str) -> Option<TrackedTask<S::Status>> {
        self.inner.registry.remove(id)
    }

    #[must_use]
    pub fn is_finalized(&self, status: S::Status) -> bool {
        status.is_finalized()
    }

    #[must_use]
    pub fn is_succeeded(&self, status: S::Status) -> bool {
        status.is_succeeded()
    }

    // =========================================================================
    // Remote operations
    // =========================================================================

    /// Start a new job and track it.
    ///
    /// Submits `input.payload` to the AI service, inserts the owning record
    /// at the kind's initial status and registers the task.
    pub async fn submit(&self, parent: AggregateKey, input: TaskInput) -> Result<TrackedTask<S::Status>> {
        let kind = self.kind();
        let query_id = self.services().ai.submit(kind, &input.payload).await?;

        let mut task: TrackedTask<S::Status> =
            TrackedTask::new(kind, query_id.as_str(), parent, input)
                .with_id(self.inner.strategy.task_id(&query_id, &parent));
        task.created_at = self.inner.clock.now();

        let record = TaskRecord::new(
            self.inner.strategy.record_key(parent),
            query_id.as_str(),
            task.status.as_str(),
            task.input.clone(),
        );
        self.services().store.insert(record).await?;

        self.add_task(task.clone());
        Ok(task)
    }

    /// Ask the AI service to stop a job.
    ///
    /// Local state is untouched: the STOPPED status arrives through the
    /// next poll like any other status change.
    pub async fn cancel(&self, query_id: &str) -> Result<()> {
        info!(kind = %self.kind(), query_id, "Cancelling job");
        self.services().ai.cancel(self.kind(), query_id).await
    }

    /// Re-register an unfinished task from its persisted record.
    ///
    /// Returns `Ok(None)` for records without a query id or already in a
    /// terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UnknownStatus`] if the stored status is not
    /// part of this kind's vocabulary.
    pub fn rehydrate_record(&self, record: &TaskRecord) -> Result<Option<TrackedTask<S::Status>>> {
        let kind = self.kind();
        let Some(query_id) = record.query_id.as_deref() else {
            return Ok(None);
        };
        let status = match record.status.as_deref() {
            Some(raw) => S::Status::parse(kind, raw)?,
            None => S::Status::initial(),
        };
        if status.is_finalized() {
            return Ok(None);
        }

        let parent = record.key.parent;
        let mut task = TrackedTask::new(kind, query_id, parent, record.input.clone())
            .with_id(self.inner.strategy.task_id(query_id, &parent))
            .with_status(status);
        task.created_at = record.created_at;

        self.add_task(task.clone());
        Ok(Some(task))
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run one tick: purge expired retained tasks and start a poll for every
    /// active task that has none in flight.
    pub fn tick(&self) -> DispatchedTick {
        let now = self.inner.clock.now();
        let evicted = self
            .inner
            .evictor
            .map(|evictor| evictor.sweep(&self.inner.registry, now))
            .unwrap_or_default();

        let mut handles = Vec::new();
        let mut skipped = 0;
        for task in self.inner.registry.snapshot() {
            let Some(guard) = self.inner.registry.try_begin_poll(&task.id) else {
                debug!(kind = %self.kind(), task_id = %task.id, "Poll still in flight; skipping");
                skipped += 1;
                continue;
            };
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move { inner.poll(guard).await }));
        }

        DispatchedTick {
            dispatched: handles.len(),
            handles,
            skipped,
            evicted,
        }
    }

    /// Spawn the fixed-interval loop. It runs until [`stop`](Self::stop).
    pub fn start(&self) -> JoinHandle<()> {
        let tracker = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.options.poll_interval;

        info!(kind = %self.kind(), interval_ms = period.as_millis() as u64, "Starting tracker");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let tick = tracker.tick();
                        if tick.dispatched > 0 || tick.skipped > 0 {
                            debug!(
                                kind = %tracker.kind(),
                                dispatched = tick.dispatched,
                                skipped = tick.skipped,
                                "Tick"
                            );
                        }
                    }
                }
            }
            info!(kind = %tracker.kind(), "Tracker stopped");
        })
    }

    /// Signal the loop to exit. Polls already started run to completion.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

// ============================================================================
// Poll
// ============================================================================

impl<S: TrackerStrategy> Inner<S> {
    async fn poll(&self, guard: PollGuard<S::Status>) -> PollOutcome {
        let kind = self.strategy.kind();
        let task = guard.task();
        debug!(kind = %kind, task_id = %task.id, query_id = %task.query_id, "Polling task");

        let result = match self.strategy.fetch(&task).await {
            Ok(result) => result,
            Err(e) => {
                self.record_failure(&guard, &task, &e);
                return PollOutcome::Failed;
            }
        };
        if !self.registry.is_current(&guard) {
            return self.superseded(&task);
        }

        let status = match S::Status::parse(kind, &result.status) {
            Ok(status) => status,
            Err(e) => {
                self.record_failure(&guard, &task, &e);
                return PollOutcome::Failed;
            }
        };

        let now = self.clock.now();
        let normalized = result.merged_response().map(|r| self.strategy.normalize(&r));

        if status == task.status && !status.is_finalized() {
            guard.update(|t| {
                t.last_polled = Some(now);
                t.result = normalized;
                t.error = result.error.clone();
                t.consecutive_failures = 0;
                t.stuck = false;
            });
            return PollOutcome::Unchanged;
        }

        match self.strategy.persist(&task, status, &result).await {
            Ok(()) => {}
            Err(TrackerError::RecordSuperseded { .. }) => return self.superseded(&task),
            Err(e) => {
                self.record_failure(&guard, &task, &e);
                return PollOutcome::Failed;
            }
        }

        let task = guard.update(|t| {
            t.status = status;
            t.last_polled = Some(now);
            t.result = normalized;
            t.error = result.error.clone();
            t.consecutive_failures = 0;
            t.stuck = false;
            t.clone()
        });
        info!(
            kind = %kind,
            task_id = %task.id,
            query_id = %task.query_id,
            status = %status,
            "Task status changed"
        );

        if !status.is_finalized() {
            return PollOutcome::Updated;
        }
        self.finalize(&guard, task, now).await
    }

    async fn finalize(
        &self,
        guard: &PollGuard<S::Status>,
        task: TrackedTask<S::Status>,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let kind = self.strategy.kind();
        let succeeded = task.status.is_succeeded();
        if !self.registry.is_current(guard) {
            return self.superseded(&task);
        }

        if succeeded {
            if let Err(e) = self.strategy.merge(&task).await {
                error!(
                    kind = %kind,
                    task_id = %task.id,
                    query_id = %task.query_id,
                    error = %e,
                    "Failed to merge result"
                );
                if let Err(record_err) = self.strategy.record_merge_error(&task, &e).await {
                    error!(
                        kind = %kind,
                        task_id = %task.id,
                        error = %record_err,
                        "Failed to record merge error"
                    );
                }
            }
        }

        self.telemetry.send_event(
            self.strategy.telemetry_event().as_str(),
            self.strategy.telemetry_properties(&task),
            Some(TELEMETRY_SERVICE),
            succeeded,
        );

        self.registry
            .retire_polled(guard, now, self.evictor.is_some());
        info!(
            kind = %kind,
            task_id = %task.id,
            query_id = %task.query_id,
            status = %task.status,
            "Task finalized"
        );
        PollOutcome::Finalized { succeeded }
    }

    fn superseded(&self, task: &TrackedTask<S::Status>) -> PollOutcome {
        info!(
            kind = %self.strategy.kind(),
            task_id = %task.id,
            query_id = %task.query_id,
            "Task superseded while polling; dropping result"
        );
        PollOutcome::Superseded
    }

    fn record_failure(&self, guard: &PollGuard<S::Status>, task: &TrackedTask<S::Status>, err: &TrackerError) {
        let kind = self.strategy.kind();
        let threshold = self.options.stuck_after_failures;
        let (failures, newly_stuck) = guard.update(|t| {
            t.consecutive_failures = t.consecutive_failures.saturating_add(1);
            let stuck = err.is_permanent() || (threshold > 0 && t.consecutive_failures >= threshold);
            let newly_stuck = stuck && !t.stuck;
            t.stuck |= stuck;
            (t.consecutive_failures, newly_stuck)
        });

        if matches!(err, TrackerError::UnknownStatus { .. }) {
            error!(
                kind = %kind,
                task_id = %task.id,
                query_id = %task.query_id,
                failures,
                error = %err,
                "Unrecognized status; task stays active"
            );
        } else if newly_stuck {
            error!(
                kind = %kind,
                task_id = %task.id,
                query_id = %task.query_id,
                failures,
                error_code = err.error_code(),
                error = %err,
                "Task looks stuck; still retrying every tick"
            );
        } else {
            warn!(
                kind = %kind,
                task_id = %task.id,
                query_id = %task.query_id,
                failures,
                error = %err,
                "Poll failed; retrying next tick"
            );
        }
    }
}
