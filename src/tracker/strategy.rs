//! Per-kind behaviour plugged into the generic [`Tracker`](super::Tracker).

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::{Result, TrackerError};
use crate::remote::{AiService, RemoteResult};
use crate::status::JobStatus;
use crate::store::{AggregateStore, RecordKey, RecordPatch};
use crate::task::{AggregateKey, TaskKind, TrackedTask};
use crate::telemetry::TelemetryEvent;

/// External collaborators shared by every strategy.
#[derive(Clone)]
pub struct Services {
    pub ai: Arc<dyn AiService>,
    pub store: Arc<dyn AggregateStore>,
}

impl Services {
    #[must_use]
    pub fn new(ai: Arc<dyn AiService>, store: Arc<dyn AggregateStore>) -> Self {
        Self { ai, store }
    }
}

/// What varies between job kinds.
///
/// The engine owns scheduling, the in-flight guard, change detection,
/// failure accounting and retirement. A strategy only says how to read a
/// job, how to shape and persist its result, and what to do once it is
/// done. Every method except [`kind`](Self::kind) and
/// [`services`](Self::services) has a default that fits most kinds.
///
/// # Example
///
/// ```rust,ignore
/// struct SummaryStrategy { services: Services }
///
/// #[async_trait]
/// impl TrackerStrategy for SummaryStrategy {
///     type Status = AskStatus;
///
///     fn kind(&self) -> TaskKind { TaskKind::Ask }
///     fn services(&self) -> &Services { &self.services }
/// }
/// ```
#[async_trait]
pub trait TrackerStrategy: Send + Sync + 'static {
    type Status: JobStatus;

    fn kind(&self) -> TaskKind;

    fn services(&self) -> &Services;

    /// Registry key for a new task. Defaults to the query id.
    fn task_id(&self, query_id: &str, _parent: &AggregateKey) -> String {
        query_id.to_string()
    }

    /// Record this kind writes its status into.
    fn record_key(&self, parent: AggregateKey) -> RecordKey {
        RecordKey::new(parent, self.kind())
    }

    /// Read the job's current state. Must not retry.
    async fn fetch(&self, task: &TrackedTask<Self::Status>) -> Result<RemoteResult> {
        self.services().ai.fetch(self.kind(), &task.query_id).await
    }

    /// Shape a raw response into the `detail` blob that gets persisted.
    fn normalize(&self, response: &Value) -> Value {
        response.clone()
    }

    /// Write a status change through to the owning record.
    ///
    /// The write is guarded by the task's query id, so a task that has been
    /// superseded on its record cannot overwrite its replacement.
    async fn persist(
        &self,
        task: &TrackedTask<Self::Status>,
        status: Self::Status,
        result: &RemoteResult,
    ) -> Result<()> {
        let detail = result.merged_response().map(|r| self.normalize(&r));
        let error = result
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let patch = RecordPatch::status(status.as_str())
            .with_detail(detail)
            .with_error(error)
            .owned_by(task.query_id.as_str());
        self.services()
            .store
            .update_one(&self.record_key(task.parent), patch)
            .await
    }

    /// Fold a successful terminal result into other aggregates.
    ///
    /// Called once, after the terminal status has been persisted.
    async fn merge(&self, _task: &TrackedTask<Self::Status>) -> Result<()> {
        Ok(())
    }

    /// Record a merge failure next to the task's status.
    async fn record_merge_error(
        &self,
        task: &TrackedTask<Self::Status>,
        error: &TrackerError,
    ) -> Result<()> {
        let payload = json!({
            "code": error.error_code(),
            "message": error.to_string(),
        });
        self.services()
            .store
            .update_one(
                &self.record_key(task.parent),
                RecordPatch::merge_error(payload).owned_by(task.query_id.as_str()),
            )
            .await
    }

    fn telemetry_event(&self) -> TelemetryEvent {
        TelemetryEvent::for_kind(self.kind())
    }

    /// Kind-specific telemetry properties, added to the common ones.
    fn telemetry_extras(&self, _task: &TrackedTask<Self::Status>, _props: &mut Map<String, Value>) {}

    /// Properties sent with the finalization event.
    fn telemetry_properties(&self, task: &TrackedTask<Self::Status>) -> Value {
        let mut props = Map::new();
        props.insert("query_id".into(), json!(task.query_id));
        props.insert("kind".into(), json!(self.kind()));
        props.insert("status".into(), json!(task.status.as_str()));
        if let Some(question) = task.question() {
            props.insert("question".into(), json!(question));
        }
        if let Some(error) = &task.error {
            props.insert("error".into(), json!(error));
        }
        self.telemetry_extras(task, &mut props);
        Value::Object(props)
    }
}
