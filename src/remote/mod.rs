//! Remote AI service contract.
//!
//! The AI service answers asynchronously: submitting a request returns an
//! opaque query id, and the real answer is read back by polling the kind's
//! result endpoint until it reports a terminal status.
//!
//! - [`AiService`] - submit / fetch / cancel, one call per job kind
//! - [`AiServiceClient`] - HTTP implementation over `reqwest`
//! - [`RemoteResult`] - `{status, response?, error?}` as returned by a poll
//!
//! Implementations never retry internally. A failed fetch is reported to
//! the tracker, which tries again on its next tick.

mod client;

pub use client::AiServiceClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::task::TaskKind;

/// Structured error reported by the AI service for a failed job.
///
/// This is persisted into the aggregate's `error` column and surfaced to
/// readers; it is never raised as a Rust error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default = "default_error_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn default_error_code() -> String {
    "OTHERS".to_string()
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One poll's view of a remote job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    /// Raw status string; parsed by the tracker, not here
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    /// Any other top-level fields the service sends (e.g. `retrievedTables`);
    /// see [`merged_response`](Self::merged_response)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RemoteResult {
    /// A result carrying only a status.
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            response: None,
            error: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: RemoteError) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The response body with the extra fields folded in.
    ///
    /// Extras only fill keys an object body lacks; non-object bodies are
    /// returned as-is.
    #[must_use]
    pub fn merged_response(&self) -> Option<Value> {
        match &self.response {
            Some(Value::Object(body)) if !self.extra.is_empty() => {
                let mut merged = self.extra.clone();
                merged.extend(body.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(Value::Object(merged))
            }
            other => other.clone(),
        }
    }
}

/// Abstraction over the remote AI service.
///
/// Object-safe so trackers can share one `Arc<dyn AiService>`.
#[async_trait]
pub trait AiService: Send + Sync {
    /// Start a job and return its query id.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Submit`](crate::TrackerError::Submit) if the
    /// service refuses or cannot be reached.
    async fn submit(&self, kind: TaskKind, payload: &Value) -> Result<String>;

    /// Read a job's current status and result.
    ///
    /// # Errors
    ///
    /// Returns a transient error for network failures and 5xx responses,
    /// [`TrackerError::RemoteRejected`](crate::TrackerError::RemoteRejected)
    /// for other 4xx responses.
    async fn fetch(&self, kind: TaskKind, query_id: &str) -> Result<RemoteResult>;

    /// Ask the service to stop a job.
    ///
    /// Only the remote side changes; the local task sees `STOPPED` on its
    /// next poll.
    async fn cancel(&self, kind: TaskKind, query_id: &str) -> Result<()>;
}

/// HTTP routes for one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Collection path, e.g. `/v1/asks`
    pub path: &'static str,
    /// Appended to `<path>/<query_id>` when reading results
    pub result_suffix: &'static str,
    /// Whether the service supports stopping this kind
    pub cancellable: bool,
}

impl Endpoint {
    /// Routes for a kind.
    ///
    /// # Example
    ///
    /// ```
    /// use asktrack::remote::Endpoint;
    /// use asktrack::task::TaskKind;
    ///
    /// let endpoint = Endpoint::for_kind(TaskKind::Ask);
    /// assert_eq!(endpoint.result_path("q1"), "/v1/asks/q1/result");
    /// ```
    #[must_use]
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Ask => Self::new("/v1/asks", "/result", true),
            TaskKind::AskDetail => Self::new("/v1/ask-details", "/result", true),
            TaskKind::Explain => Self::new("/v1/sql-explanations", "/result", false),
            TaskKind::Chart => Self::new("/v1/charts", "", true),
            TaskKind::ChartAdjustment => Self::new("/v1/chart-adjustments", "", true),
            TaskKind::RecommendQuestions => Self::new("/v1/question-recommendations", "", false),
            TaskKind::Adjustment => Self::new("/v1/ask-feedbacks", "", true),
        }
    }

    const fn new(path: &'static str, result_suffix: &'static str, cancellable: bool) -> Self {
        Self {
            path,
            result_suffix,
            cancellable,
        }
    }

    #[must_use]
    pub fn job_path(&self, query_id: &str) -> String {
        format!("{}/{}", self.path, query_id)
    }

    #[must_use]
    pub fn result_path(&self, query_id: &str) -> String {
        format!("{}/{}{}", self.path, query_id, self.result_suffix)
    }
}
