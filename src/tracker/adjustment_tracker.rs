//! SQL adjustment tracking with re-runs and a read-after-finish window.
//!
//! Adjustment results are read back right after they finish, usually by
//! the same client that is waiting on them. Instead of forgetting a
//! finalized task, this tracker keeps it readable by query id and by
//! owning aggregate for a retention window (5 minutes by default), and
//! purges it during a later tick.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use super::engine::{DispatchedTick, Tracker, TrackerOptions};
use super::kinds::AdjustmentStrategy;
use super::retention::DEFAULT_RETENTION_SECS;
use super::strategy::{Services, TrackerStrategy};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TrackerError};
use crate::status::{AdjustmentStatus, JobStatus};
use crate::store::{RecordPatch, TaskRecord};
use crate::task::{AggregateKey, TaskInput, TrackedTask};
use crate::telemetry::Telemetry;

/// Tracker for ADJUSTMENT jobs with dual lookup and retention.
#[derive(Clone)]
pub struct AdjustmentTaskTracker {
    tracker: Tracker<AdjustmentStrategy>,
}

impl AdjustmentTaskTracker {
    /// Create a tracker. A missing retention window defaults to 5 minutes.
    #[must_use]
    pub fn new(services: Services, telemetry: Arc<dyn Telemetry>, options: TrackerOptions) -> Self {
        Self::with_clock(services, telemetry, options, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        services: Services,
        telemetry: Arc<dyn Telemetry>,
        mut options: TrackerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if options.retention.is_none() {
            options.retention = Some(Duration::seconds(DEFAULT_RETENTION_SECS));
        }
        Self {
            tracker: Tracker::with_clock(AdjustmentStrategy::new(services), telemetry, options, clock),
        }
    }

    /// The underlying generic tracker.
    #[must_use]
    pub fn tracker(&self) -> &Tracker<AdjustmentStrategy> {
        &self.tracker
    }

    /// Start an adjustment for `parent`.
    ///
    /// The payload is kept with the task and its record so the adjustment
    /// can be [`rerun`](Self::rerun) later.
    pub async fn create(&self, parent: AggregateKey, input: TaskInput) -> Result<TrackedTask<AdjustmentStatus>> {
        self.tracker.submit(parent, input).await
    }

    /// Run the last adjustment for `parent` again under a new query id.
    ///
    /// The payload comes from the tracked task if it is still in memory,
    /// otherwise from the persisted record. A still-running previous job is
    /// dropped from tracking; its record is pointed at the new query id
    /// with errors cleared.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::TaskNotFound`] if there is no previous
    /// adjustment for `parent`.
    pub async fn rerun(&self, parent: AggregateKey) -> Result<TrackedTask<AdjustmentStatus>> {
        let strategy = self.tracker.strategy();
        let services = self.tracker.services();
        let key = strategy.record_key(parent);

        let previous = self.tracker.get_by_parent(&parent);
        let record = services.store.find_one(&key).await?;
        let input = previous
            .as_ref()
            .map(|t| t.input.clone())
            .or_else(|| record.as_ref().map(|r| r.input.clone()))
            .ok_or_else(|| TrackerError::TaskNotFound { id: key.to_string() })?;

        let query_id = services.ai.submit(strategy.kind(), &input.payload).await?;

        if let Some(previous) = previous.filter(|t| !t.is_finalized()) {
            info!(
                query_id = %previous.query_id,
                replacement = %query_id,
                parent = %parent,
                "Superseding running adjustment"
            );
            self.tracker.remove_task(&previous.id);
        }

        let initial = AdjustmentStatus::initial();
        match record {
            Some(_) => {
                let patch = RecordPatch::status(initial.as_str())
                    .with_query_id(query_id.as_str())
                    .clearing_errors();
                services.store.update_one(&key, patch).await?;
            }
            None => {
                services
                    .store
                    .insert(TaskRecord::new(key, query_id.as_str(), initial.as_str(), input.clone()))
                    .await?;
            }
        }

        let task = TrackedTask::new(strategy.kind(), query_id.as_str(), parent, input)
            .with_id(strategy.task_id(&query_id, &parent));
        self.tracker.add_task(task.clone());
        Ok(task)
    }

    /// Ask the AI service to stop an adjustment. Takes effect on the next poll.
    pub async fn cancel(&self, query_id: &str) -> Result<()> {
        self.tracker.cancel(query_id).await
    }

    /// Look up an active or recently finalized adjustment by query id.
    #[must_use]
    pub fn get_by_query_id(&self, query_id: &str) -> Option<TrackedTask<AdjustmentStatus>> {
        self.tracker.get_by_query_id(query_id)
    }

    /// Look up the latest active or recently finalized adjustment of `parent`.
    #[must_use]
    pub fn get_by_parent(&self, parent: &AggregateKey) -> Option<TrackedTask<AdjustmentStatus>> {
        self.tracker.get_by_parent(parent)
    }

    pub fn tick(&self) -> DispatchedTick {
        self.tracker.tick()
    }

    pub fn start(&self) -> JoinHandle<()> {
        self.tracker.start()
    }

    pub fn stop(&self) {
        self.tracker.stop();
    }
}
