//! Tracked task domain model.
//!
//! A [`TrackedTask`] is the in-memory unit of work for one remote job. It is
//! created by the code path that obtained the job's query id and is mutated
//! only by the owning tracker's tick.
//!
//! ```text
//! TrackedTask
//!   ├── id            registry key (query id or owning aggregate id)
//!   ├── kind          TaskKind
//!   ├── query_id      remote job token
//!   ├── status        kind-specific JobStatus
//!   ├── result/error  last normalized payload
//!   ├── parent        AggregateKey (non-owning back-reference)
//!   └── finalized_at  set once, never cleared
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::remote::RemoteError;
use crate::status::JobStatus;

// ============================================================================
// Task Kind
// ============================================================================

/// The kind of asynchronous job being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Candidate SQL generation for a question
    Ask,
    /// Step-by-step SQL breakdown of an answer
    AskDetail,
    /// Natural-language explanation of SQL steps
    Explain,
    /// Chart spec generation
    Chart,
    /// Chart spec adjustment
    ChartAdjustment,
    /// Recommended follow-up questions
    RecommendQuestions,
    /// SQL adjustment driven by user feedback
    Adjustment,
}

impl TaskKind {
    /// Wire name of the kind.
    ///
    /// # Example
    ///
    /// ```
    /// use asktrack::task::TaskKind;
    ///
    /// assert_eq!(TaskKind::AskDetail.as_str(), "ASK_DETAIL");
    /// ```
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ASK",
            Self::AskDetail => "ASK_DETAIL",
            Self::Explain => "EXPLAIN",
            Self::Chart => "CHART",
            Self::ChartAdjustment => "CHART_ADJUSTMENT",
            Self::RecommendQuestions => "RECOMMEND_QUESTIONS",
            Self::Adjustment => "ADJUSTMENT",
        }
    }

    /// All kinds, in pipeline order.
    #[must_use]
    pub fn all() -> [TaskKind; 7] {
        [
            Self::Ask,
            Self::AskDetail,
            Self::Explain,
            Self::Chart,
            Self::ChartAdjustment,
            Self::RecommendQuestions,
            Self::Adjustment,
        ]
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::all()
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown task kind '{}'", s))
    }
}

// ============================================================================
// Aggregate References
// ============================================================================

/// The persisted aggregate a task augments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    AskingTask,
    ThreadResponse,
    Thread,
    Project,
    DashboardItem,
}

impl AggregateKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AskingTask => "asking_task",
            Self::ThreadResponse => "thread_response",
            Self::Thread => "thread",
            Self::Project => "project",
            Self::DashboardItem => "dashboard_item",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "asking_task" => Ok(Self::AskingTask),
            "thread_response" => Ok(Self::ThreadResponse),
            "thread" => Ok(Self::Thread),
            "project" => Ok(Self::Project),
            "dashboard_item" => Ok(Self::DashboardItem),
            other => Err(format!("unknown aggregate kind '{}'", other)),
        }
    }
}

/// Non-owning reference to a persisted aggregate row.
///
/// Used to address writes; never used to free the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub kind: AggregateKind,
    pub id: i64,
}

impl AggregateKey {
    #[must_use]
    pub fn new(kind: AggregateKind, id: i64) -> Self {
        Self { kind, id }
    }

    #[must_use]
    pub fn thread_response(id: i64) -> Self {
        Self::new(AggregateKind::ThreadResponse, id)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ============================================================================
// Task Input
// ============================================================================

/// The request that started a job.
///
/// Kept with the task so telemetry can report the question and so
/// adjustments can be re-run with the same payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// The user's question, when the job has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// The request body sent to the AI service
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskInput {
    #[must_use]
    pub fn question(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            payload: serde_json::json!({ "query": question }),
            question: Some(question),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Tracked Task
// ============================================================================

/// In-memory state for one remote job.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedTask<St: JobStatus> {
    /// Registry key
    pub id: String,
    pub kind: TaskKind,
    /// Opaque token returned by the AI service
    pub query_id: String,
    /// Last known status
    pub status: St,
    /// When the last successful fetch happened
    pub last_polled: Option<DateTime<Utc>>,
    /// Last fetched, normalized response payload
    pub result: Option<serde_json::Value>,
    /// Last fetched structured error
    pub error: Option<RemoteError>,
    /// Aggregate this task augments
    pub parent: AggregateKey,
    pub input: TaskInput,
    pub created_at: DateTime<Utc>,
    /// Set once on finalization
    pub finalized_at: Option<DateTime<Utc>>,
    /// Copied from the registry guard when the snapshot was taken
    pub in_flight: bool,
    /// Fetch or status failures since the last good poll
    pub consecutive_failures: u32,
    /// Set once failures stop looking transient
    pub stuck: bool,
}

impl<St: JobStatus> TrackedTask<St> {
    /// Create a task keyed by its query id, starting at the kind's initial status.
    #[must_use]
    pub fn new(
        kind: TaskKind,
        query_id: impl Into<String>,
        parent: AggregateKey,
        input: TaskInput,
    ) -> Self {
        let query_id = query_id.into();
        Self {
            id: query_id.clone(),
            kind,
            query_id,
            status: St::initial(),
            last_polled: None,
            result: None,
            error: None,
            parent,
            input,
            created_at: Utc::now(),
            finalized_at: None,
            in_flight: false,
            consecutive_failures: 0,
            stuck: false,
        }
    }

    /// Override the registry key.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the starting status (used when re-hydrating from persistence).
    #[must_use]
    pub fn with_status(mut self, status: St) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// The question that started the job, if any.
    #[must_use]
    pub fn question(&self) -> Option<&str> {
        self.input.question.as_deref()
    }
}

// ============================================================================
// Task Snapshot
// ============================================================================

/// Kind-erased copy of a tracked task, for listings across trackers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: TaskKind,
    pub query_id: String,
    pub status: String,
    pub parent: AggregateKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_polled: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub stuck: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl<St: JobStatus> From<&TrackedTask<St>> for TaskSnapshot {
    fn from(task: &TrackedTask<St>) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            query_id: task.query_id.clone(),
            status: task.status.as_str().to_string(),
            parent: task.parent,
            question: task.input.question.clone(),
            created_at: task.created_at,
            last_polled: task.last_polled,
            finalized_at: task.finalized_at,
            in_flight: task.in_flight,
            consecutive_failures: task.consecutive_failures,
            stuck: task.stuck,
            error: task.error.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
